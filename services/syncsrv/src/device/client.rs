//! Device REST client
//!
//! One client per device. Every public operation holds the session lock for
//! its whole duration, retries included, so at most one request is in flight
//! per device and a re-authentication can never interleave with another
//! request's use of the old cookie.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::DateTime;
use chrono_tz::Tz;
use errors::{ClassifiedError, SyncError, SyncResult};
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::endpoint::EndpointIndex;
use super::protocol::{
    enumeration_query, BatchRequest, BatchResult, ObjectRef, ReadOp, WriteOp, API_ROOT,
    BATCH_PATH, NTP_PATH, OBJECTS_PATH, TIME_PATH,
};
use super::retry::RetryPolicy;
use super::session::{parse_set_cookie, Session};
use crate::settings::DeviceSettings;

/// Connection options shared by every device client
#[derive(Debug, Clone)]
pub struct DeviceClientOptions {
    pub username: String,
    pub password: String,
    /// `https` for real controllers; `http` for local mocks
    pub scheme: String,
    pub accept_invalid_certs: bool,
    pub request_timeout: Duration,
    /// Policy for transient failures of a request or batch
    pub retry: RetryPolicy,
    /// Policy for the login handshake
    pub auth_retry: RetryPolicy,
}

impl From<&DeviceSettings> for DeviceClientOptions {
    fn from(settings: &DeviceSettings) -> Self {
        Self {
            username: settings.username.clone(),
            password: settings.password.clone(),
            scheme: settings.scheme.clone(),
            accept_invalid_certs: settings.accept_invalid_certs,
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            retry: RetryPolicy::from(&settings.retry),
            auth_retry: RetryPolicy::from(&settings.auth_retry),
        }
    }
}

/// Authenticated channel to one device
#[derive(Debug)]
pub struct DeviceClient {
    host: String,
    base_url: String,
    http: reqwest::Client,
    username: String,
    password: String,
    retry: RetryPolicy,
    auth_retry: RetryPolicy,
    session: Mutex<Option<Session>>,
    session_counter: AtomicU64,
}

impl DeviceClient {
    /// Create a client for `host` (`ip` or `ip:port`)
    pub fn new(host: &str, options: &DeviceClientOptions) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client for {}: {}", host, e)))?;

        Ok(Self {
            host: host.to_string(),
            base_url: format!("{}://{}{}", options.scheme, host, API_ROOT),
            http,
            username: options.username.clone(),
            password: options.password.clone(),
            retry: options.retry.clone(),
            auth_retry: options.auth_retry.clone(),
            session: Mutex::new(None),
            session_counter: AtomicU64::new(0),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ========================================================================
    // Session handling
    // ========================================================================

    /// Log in and replace the cached session
    ///
    /// Retried with backoff up to the auth policy's bound; after that the
    /// error is returned and the device sits out the current cycle.
    pub async fn authenticate(&self) -> SyncResult<Session> {
        let mut slot = self.session.lock().await;
        *slot = None;
        self.login(&mut slot).await
    }

    /// Current session, logging in first if there is none
    pub async fn session(&self) -> SyncResult<Session> {
        let mut slot = self.session.lock().await;
        self.ensure_session(&mut slot).await
    }

    async fn ensure_session(&self, slot: &mut Option<Session>) -> SyncResult<Session> {
        match slot.as_ref() {
            Some(session) => Ok(session.clone()),
            None => self.login(slot).await,
        }
    }

    async fn login(&self, slot: &mut Option<Session>) -> SyncResult<Session> {
        let label = format!("login to {}", self.host);
        // Every login failure is worth another try within the bound
        let session = self
            .auth_retry
            .run_if(&label, || self.login_once(), |e| {
                e.is_retryable() || e.is_auth_expiry()
            })
            .await
            .map_err(|e| match e {
                SyncError::Authentication { .. } => e,
                other => SyncError::Authentication {
                    device: self.host.clone(),
                    reason: other.to_string(),
                },
            })?;
        info!(
            "Authenticated to {} (session {})",
            self.host,
            session.version()
        );
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn login_once(&self) -> SyncResult<Session> {
        let url = self.url(TIME_PATH);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| SyncError::from_transport(&url, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => SyncError::Authentication {
                    device: self.host.clone(),
                    reason: format!("HTTP {}", status.as_u16()),
                },
                code => SyncError::from_status(&url, code, body),
            });
        }

        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_set_cookie);
        if cookie.is_none() {
            debug!("{} issued no session cookie; using basic auth only", self.host);
        }

        let version = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session::new(version, cookie))
    }

    // ========================================================================
    // Request plumbing
    // ========================================================================

    async fn send_once(
        &self,
        session: &Session,
        method: &Method,
        url: &str,
        body: Option<&Value>,
    ) -> SyncResult<Value> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(cookie) = session.cookie() {
            request = request.header(COOKIE, cookie);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::from_transport(url, &e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SyncError::from_transport(url, &e))?;

        if !status.is_success() {
            return Err(SyncError::from_status(url, status.as_u16(), text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        match serde_json::from_str(&text) {
            Ok(value) => Ok(value),
            // A batch reply decides which writes count as delivered
            Err(e) if url.ends_with(BATCH_PATH) => Err(SyncError::Serialization(format!(
                "unreadable batch reply from {}: {}",
                self.host, e
            ))),
            Err(_) => {
                debug!("{}: non-JSON reply from {}", self.host, url);
                Ok(Value::String(text))
            },
        }
    }

    /// Send one request with the full resilience policy
    ///
    /// Transient failures are retried with backoff. An authentication expiry
    /// drops the session, logs in again and retries exactly once more.
    async fn execute(
        &self,
        slot: &mut Option<Session>,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> SyncResult<(Session, Value)> {
        let url = self.url(path);
        let label = format!("{} {}", method, url);
        let mut reauthenticated = false;

        loop {
            let session = self.ensure_session(slot).await?;
            let result = self
                .retry
                .run(&label, || self.send_once(&session, &method, &url, body.as_ref()))
                .await;

            match result {
                Ok(value) => return Ok((session, value)),
                Err(e) if e.is_auth_expiry() && !reauthenticated => {
                    warn!("{}: session rejected ({}); re-authenticating", self.host, e);
                    *slot = None;
                    reauthenticated = true;
                },
                Err(e) => {
                    if e.is_auth_expiry() {
                        *slot = None;
                    }
                    return Err(e);
                },
            }
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Enumerate every supported object on the device
    pub async fn discover_endpoints(&self) -> SyncResult<EndpointIndex> {
        let mut slot = self.session.lock().await;
        let path = format!("{}?{}", OBJECTS_PATH, enumeration_query());
        let (_, reply) = self.execute(&mut slot, Method::GET, &path, None).await?;
        let index = EndpointIndex::from_enumeration(&reply)?;
        info!("{}: discovered {} objects", self.host, index.len());
        Ok(index)
    }

    /// Set or clear the out-of-service flag of one object
    ///
    /// Idempotent on the device. Returns the version of the session the
    /// assertion was made under.
    pub async fn set_out_of_service(&self, object: ObjectRef, flag: bool) -> SyncResult<u64> {
        let mut slot = self.session.lock().await;
        let path = format!("{}/out-of-service", object.path());
        let (session, _) = self
            .execute(&mut slot, Method::POST, &path, Some(json!({ "value": flag })))
            .await?;
        debug!(
            "{}: {} {} out-of-service={}",
            self.host, object.object_type, object.instance, flag
        );
        Ok(session.version())
    }

    /// Execute all reads and writes for this cycle in one request
    ///
    /// Per-operation failures are reported in the result; only a failure of
    /// the request as a whole is an error.
    pub async fn send_batch(&self, reads: &[ReadOp], writes: &[WriteOp]) -> SyncResult<BatchResult> {
        let request = BatchRequest::build(reads, writes);
        if request.is_empty() {
            return Ok(BatchResult::default());
        }
        let body = serde_json::to_value(&request)?;

        let mut slot = self.session.lock().await;
        let (_, reply) = self
            .execute(&mut slot, Method::POST, BATCH_PATH, Some(body))
            .await?;
        let result = BatchResult::from_reply(reads, writes, &reply);
        debug!(
            "{}: batch of {} reads, {} writes, {} failed",
            self.host,
            reads.len(),
            writes.len(),
            result.failure_count()
        );
        Ok(result)
    }

    /// Turn off NTP so a pushed clock is not overwritten
    pub async fn disable_ntp(&self) -> SyncResult<()> {
        let mut slot = self.session.lock().await;
        self.execute(&mut slot, Method::POST, NTP_PATH, Some(json!({ "enabled": false })))
            .await?;
        info!("{}: NTP disabled", self.host);
        Ok(())
    }

    /// Push wall-clock time and timezone to the device
    pub async fn set_time_and_timezone(&self, timezone: &str, epoch_seconds: i64) -> SyncResult<()> {
        let date_time = device_local_time(epoch_seconds, timezone)?;
        let body = json!({ "time-zone": timezone, "date-time": date_time });

        let mut slot = self.session.lock().await;
        self.execute(&mut slot, Method::POST, TIME_PATH, Some(body)).await?;
        info!("{}: clock set to {} {}", self.host, date_time, timezone);
        Ok(())
    }
}

/// Render `epoch_seconds` as local wall-clock time in `timezone`
pub fn device_local_time(epoch_seconds: i64, timezone: &str) -> SyncResult<String> {
    let tz: Tz = timezone
        .parse()
        .map_err(|e| SyncError::Timezone(format!("{}: {}", timezone, e)))?;
    let utc = DateTime::from_timestamp(epoch_seconds, 0)
        .ok_or_else(|| SyncError::Timezone(format!("timestamp out of range: {}", epoch_seconds)))?;
    Ok(utc.with_timezone(&tz).format("%Y-%m-%dT%H:%M:%S").to_string())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_device_local_time() {
        // 2024-01-15T12:00:00Z
        assert_eq!(
            device_local_time(1_705_320_000, "America/New_York").unwrap(),
            "2024-01-15T07:00:00"
        );
        assert_eq!(device_local_time(0, "UTC").unwrap(), "1970-01-01T00:00:00");
        assert!(matches!(
            device_local_time(0, "Mars/Olympus_Mons"),
            Err(SyncError::Timezone(_))
        ));
    }

    #[test]
    fn test_base_url() {
        let options = DeviceClientOptions {
            username: "admin".into(),
            password: "secret".into(),
            scheme: "https".into(),
            accept_invalid_certs: true,
            request_timeout: Duration::from_secs(1),
            retry: RetryPolicy::once(),
            auth_retry: RetryPolicy::once(),
        };
        let client = DeviceClient::new("10.0.0.5", &options).unwrap();
        assert_eq!(
            client.url(BATCH_PATH),
            "https://10.0.0.5/api/rest/v2/batch"
        );
    }
}
