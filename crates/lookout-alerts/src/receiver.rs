//! Notification receivers.
//!
//! This module provides the [`Receiver`] trait and the two built-in
//! receivers: [`WebhookReceiver`], which POSTs an Alertmanager-compatible
//! JSON payload, and [`LogReceiver`], which writes notifications to the log.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{AlertError, DeliveryError, Result};
use crate::types::{to_datetime, Alert, Notification, NotificationStatus};

/// Value of `endsAt` for alerts that have not ended.
const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

/// Boxed future returned by [`Receiver::send`].
pub type SendFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<(), DeliveryError>> + Send + 'a>>;

/// Something that notifications can be delivered to.
///
/// A receiver makes exactly one attempt per call. Retries are scheduled by
/// the router.
pub trait Receiver: Send + Sync + fmt::Debug {
    /// The receiver name that notifications are addressed to.
    fn name(&self) -> &str;

    /// Delivers one notification.
    ///
    /// # Errors
    ///
    /// Returns a `DeliveryError` if the receiver did not accept it.
    fn send<'a>(&'a self, notification: &'a Notification) -> SendFuture<'a>;
}

/// Posts notifications as JSON to a URL.
#[derive(Debug, Clone)]
pub struct WebhookReceiver {
    name: String,
    url: reqwest::Url,
    timeout: Duration,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl WebhookReceiver {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a webhook receiver.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidReceiver` if the URL is not an http(s)
    /// URL or the HTTP client cannot be built.
    pub fn new(name: impl Into<String>, url: &str) -> Result<Self> {
        let name = name.into();
        let invalid = |reason: String| AlertError::InvalidReceiver {
            name: name.clone(),
            reason,
        };

        let url = reqwest::Url::parse(url).map_err(|e| invalid(format!("bad url: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("lookout/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name,
            url,
            timeout: Self::DEFAULT_TIMEOUT,
            headers: HeaderMap::new(),
            client,
        })
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds request headers.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidReceiver` for a header that is not valid HTTP.
    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Result<Self> {
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                AlertError::InvalidReceiver {
                    name: self.name.clone(),
                    reason: format!("bad header name '{key}': {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| AlertError::InvalidReceiver {
                name: self.name.clone(),
                reason: format!("bad value for header '{key}': {e}"),
            })?;
            self.headers.insert(name, value);
        }
        Ok(self)
    }

    /// Returns the webhook URL.
    #[must_use]
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Returns the request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    fn transport_error(&self, err: &reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::Timeout {
                receiver: self.name.clone(),
                timeout_ms: self.timeout.as_millis(),
            }
        } else {
            DeliveryError::Request {
                receiver: self.name.clone(),
                reason: err.to_string(),
            }
        }
    }
}

impl Receiver for WebhookReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, notification: &'a Notification) -> SendFuture<'a> {
        Box::pin(async move {
            let payload = WebhookPayload::from_notification(notification);
            debug!(
                receiver = %self.name,
                url = %self.url,
                alerts = payload.alerts.len(),
                status = %payload.status,
                "sending webhook notification"
            );

            let response = self
                .client
                .post(self.url.clone())
                .headers(self.headers.clone())
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await
                .map_err(|e| self.transport_error(&e))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(DeliveryError::Status {
                    receiver: self.name.clone(),
                    status: status.as_u16(),
                })
            }
        })
    }
}

/// Writes notifications to the log.
#[derive(Debug, Clone)]
pub struct LogReceiver {
    name: String,
}

impl LogReceiver {
    /// Creates a log receiver.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogReceiver {
    fn default() -> Self {
        Self::new("log")
    }
}

impl Receiver for LogReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, notification: &'a Notification) -> SendFuture<'a> {
        Box::pin(async move {
            for alert in &notification.alerts {
                let summary = alert.annotations.get("summary").map_or("", String::as_str);
                match notification.status {
                    NotificationStatus::Firing => {
                        error!(
                            receiver = %self.name,
                            alert = %alert.name(),
                            status = %alert.status,
                            labels = ?alert.labels,
                            value = alert.value,
                            summary,
                            "ALERT FIRING"
                        );
                    }
                    NotificationStatus::Resolved => {
                        info!(
                            receiver = %self.name,
                            alert = %alert.name(),
                            labels = ?alert.labels,
                            "alert resolved"
                        );
                    }
                }
            }
            Ok(())
        })
    }
}

/// The JSON body sent by [`WebhookReceiver`].
///
/// Follows version 4 of the Alertmanager webhook format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Payload format version, always `"4"`.
    pub version: String,
    /// Key of the alert group.
    pub group_key: String,
    /// Alerts left out of this payload.
    pub truncated_alerts: usize,
    /// Firing if any alert fires.
    pub status: NotificationStatus,
    /// Receiver name.
    pub receiver: String,
    /// The grouping labels.
    pub group_labels: BTreeMap<String, String>,
    /// Labels shared by every alert.
    pub common_labels: BTreeMap<String, String>,
    /// Annotations shared by every alert.
    pub common_annotations: BTreeMap<String, String>,
    /// Link back to the engine.
    pub external_url: String,
    /// The alerts.
    pub alerts: Vec<WebhookAlert>,
}

impl WebhookPayload {
    /// Builds the payload of a notification.
    #[must_use]
    pub fn from_notification(notification: &Notification) -> Self {
        let (common_labels, common_annotations) = common(&notification.alerts);

        Self {
            version: "4".to_string(),
            group_key: notification.group_key.clone(),
            truncated_alerts: 0,
            status: notification.status,
            receiver: notification.receiver.clone(),
            group_labels: to_map(notification.group_labels.iter()),
            common_labels,
            common_annotations,
            external_url: notification.external_url.clone(),
            alerts: notification
                .alerts
                .iter()
                .map(|a| WebhookAlert::from_alert(a, &notification.external_url))
                .collect(),
        }
    }
}

fn to_map<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> BTreeMap<String, String> {
    pairs.map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn common(alerts: &[Alert]) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let Some(first) = alerts.first() else {
        return (BTreeMap::new(), BTreeMap::new());
    };

    let labels = to_map(
        first
            .labels
            .iter()
            .filter(|(k, v)| alerts.iter().all(|a| a.labels.get(k) == Some(*v))),
    );
    let annotations = first
        .annotations
        .iter()
        .filter(|(k, v)| alerts.iter().all(|a| a.annotations.get(*k) == Some(*v)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    (labels, annotations)
}

/// One alert in a [`WebhookPayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAlert {
    /// `firing` or `resolved`.
    pub status: String,
    /// Alert labels.
    pub labels: BTreeMap<String, String>,
    /// Alert annotations.
    pub annotations: BTreeMap<String, String>,
    /// RFC 3339 start time.
    pub starts_at: String,
    /// RFC 3339 end time, or the zero time while firing.
    pub ends_at: String,
    /// Link to the alert source.
    pub generator_url: String,
    /// Label set fingerprint.
    pub fingerprint: String,
}

impl WebhookAlert {
    /// Converts an alert.
    #[must_use]
    pub fn from_alert(alert: &Alert, external_url: &str) -> Self {
        let generator_url = if external_url.is_empty() {
            String::new()
        } else {
            format!("{}/api/v1/alerts", external_url.trim_end_matches('/'))
        };

        Self {
            status: alert.status.as_str().to_string(),
            labels: to_map(alert.labels.iter()),
            annotations: alert.annotations.clone(),
            starts_at: to_datetime(alert.starts_at).to_rfc3339(),
            ends_at: alert
                .ends_at
                .map_or_else(|| ZERO_TIME.to_string(), |t| to_datetime(t).to_rfc3339()),
            generator_url,
            fingerprint: alert.fingerprint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use lookout_metrics::Labels;
    use parking_lot::Mutex;

    use crate::types::{fingerprint, AlertStatus};

    fn alert(instance: &str, status: AlertStatus) -> Alert {
        let labels = Labels::new()
            .with("alertname", "InstanceDown")
            .with("job", "node")
            .with("instance", instance);
        Alert {
            fingerprint: fingerprint(&labels),
            labels,
            annotations: BTreeMap::from([
                ("summary".to_string(), format!("{instance} is down")),
                ("runbook".to_string(), "https://runbooks/down".to_string()),
            ]),
            status,
            starts_at: 1_700_000_000_000,
            ends_at: (status == AlertStatus::Resolved).then_some(1_700_000_060_000),
            value: 0.0,
        }
    }

    fn notification(alerts: Vec<Alert>) -> Notification {
        Notification::new(
            "ops",
            "{alertname=\"InstanceDown\"}",
            Labels::new().with("alertname", "InstanceDown"),
            alerts,
            1_700_000_000_000,
        )
        .with_external_url("http://lookout:9090/")
    }

    mod payload {
        use super::*;

        #[test]
        fn envelope_fields() {
            let payload = WebhookPayload::from_notification(&notification(vec![
                alert("a:9100", AlertStatus::Firing),
                alert("b:9100", AlertStatus::Firing),
            ]));

            assert_eq!(payload.version, "4");
            assert_eq!(payload.receiver, "ops");
            assert_eq!(payload.status, NotificationStatus::Firing);
            assert_eq!(payload.group_labels["alertname"], "InstanceDown");
            assert_eq!(payload.common_labels.len(), 2);
            assert!(!payload.common_labels.contains_key("instance"));
            assert_eq!(payload.common_annotations.len(), 1);
            assert!(payload.common_annotations.contains_key("runbook"));
        }

        #[test]
        fn alert_times_are_rfc3339() {
            let firing = WebhookAlert::from_alert(&alert("a", AlertStatus::Firing), "");
            assert_eq!(firing.starts_at, "2023-11-14T22:13:20+00:00");
            assert_eq!(firing.ends_at, ZERO_TIME);
            assert!(firing.generator_url.is_empty());

            let resolved =
                WebhookAlert::from_alert(&alert("a", AlertStatus::Resolved), "http://x/");
            assert_eq!(resolved.status, "resolved");
            assert_eq!(resolved.ends_at, "2023-11-14T22:14:20+00:00");
            assert_eq!(resolved.generator_url, "http://x/api/v1/alerts");
        }

        #[test]
        fn serializes_camel_case() {
            let firing = notification(vec![alert("a", AlertStatus::Firing)]);
            let payload = WebhookPayload::from_notification(&firing);
            let json = serde_json::to_value(&payload).unwrap();

            assert_eq!(json["groupKey"], "{alertname=\"InstanceDown\"}");
            assert_eq!(json["externalUrl"], "http://lookout:9090/");
            assert_eq!(json["alerts"][0]["startsAt"], "2023-11-14T22:13:20+00:00");
            assert!(json["commonAnnotations"].is_object());
        }

        #[test]
        fn empty_notification_has_no_common_labels() {
            let payload = WebhookPayload::from_notification(&notification(Vec::new()));
            assert!(payload.common_labels.is_empty());
            assert_eq!(payload.status, NotificationStatus::Resolved);
        }
    }

    mod webhook {
        use super::*;

        #[derive(Clone, Default)]
        struct Captured {
            bodies: Arc<Mutex<Vec<serde_json::Value>>>,
            tokens: Arc<Mutex<Vec<String>>>,
        }

        async fn serve(router: Router) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            format!("http://{addr}/hook")
        }

        #[test]
        fn rejects_bad_urls() {
            assert!(matches!(
                WebhookReceiver::new("ops", "not a url"),
                Err(AlertError::InvalidReceiver { .. })
            ));
            assert!(matches!(
                WebhookReceiver::new("ops", "ftp://host/hook"),
                Err(AlertError::InvalidReceiver { .. })
            ));
        }

        #[test]
        fn rejects_bad_headers() {
            let headers = BTreeMap::from([("bad header".to_string(), "x".to_string())]);
            let result = WebhookReceiver::new("ops", "http://localhost/hook")
                .unwrap()
                .with_headers(&headers);
            assert!(matches!(result, Err(AlertError::InvalidReceiver { .. })));
        }

        #[tokio::test]
        async fn posts_payload_with_headers() {
            let captured = Captured::default();
            let router = Router::new()
                .route(
                    "/hook",
                    post(
                        |State(c): State<Captured>,
                         headers: AxumHeaders,
                         Json(body): Json<serde_json::Value>| async move {
                            if let Some(token) = headers.get("x-token") {
                                c.tokens.lock().push(token.to_str().unwrap().to_string());
                            }
                            c.bodies.lock().push(body);
                            StatusCode::OK
                        },
                    ),
                )
                .with_state(captured.clone());
            let url = serve(router).await;

            let headers = BTreeMap::from([("x-token".to_string(), "secret".to_string())]);
            let receiver = WebhookReceiver::new("ops", &url)
                .unwrap()
                .with_headers(&headers)
                .unwrap();
            receiver
                .send(&notification(vec![alert("a", AlertStatus::Firing)]))
                .await
                .unwrap();

            let bodies = captured.bodies.lock();
            assert_eq!(bodies.len(), 1);
            assert_eq!(bodies[0]["version"], "4");
            assert_eq!(bodies[0]["alerts"][0]["labels"]["instance"], "a");
            assert_eq!(captured.tokens.lock().as_slice(), ["secret"]);
        }

        #[tokio::test]
        async fn non_success_status_is_an_error() {
            let router = Router::new().route("/hook", post(|| async { StatusCode::BAD_GATEWAY }));
            let url = serve(router).await;

            let receiver = WebhookReceiver::new("ops", &url).unwrap();
            let err = receiver
                .send(&notification(vec![alert("a", AlertStatus::Firing)]))
                .await
                .unwrap_err();
            assert_eq!(
                err,
                DeliveryError::Status {
                    receiver: "ops".to_string(),
                    status: 502
                }
            );
        }

        #[tokio::test]
        async fn slow_receiver_times_out() {
            let router = Router::new().route(
                "/hook",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    StatusCode::OK
                }),
            );
            let url = serve(router).await;

            let receiver = WebhookReceiver::new("ops", &url)
                .unwrap()
                .with_timeout(Duration::from_millis(100));
            let err = receiver
                .send(&notification(vec![alert("a", AlertStatus::Firing)]))
                .await
                .unwrap_err();
            assert!(matches!(err, DeliveryError::Timeout { timeout_ms: 100, .. }));
        }

        #[tokio::test]
        async fn connection_refused_is_a_request_error() {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);

            let receiver = WebhookReceiver::new("ops", &format!("http://{addr}/hook")).unwrap();
            let err = receiver
                .send(&notification(vec![alert("a", AlertStatus::Firing)]))
                .await
                .unwrap_err();
            assert!(matches!(err, DeliveryError::Request { .. }));
        }
    }

    #[tokio::test]
    async fn log_receiver_accepts_everything() {
        let receiver = LogReceiver::default();
        assert_eq!(receiver.name(), "log");
        assert!(receiver
            .send(&notification(vec![alert("a", AlertStatus::Firing)]))
            .await
            .is_ok());
        assert!(receiver
            .send(&notification(vec![alert("a", AlertStatus::Resolved)]))
            .await
            .is_ok());
    }
}
