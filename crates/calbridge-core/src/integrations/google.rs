//! Google Calendar v3 client.
//!
//! Implements [`CalendarProvider`] over plain REST calls. Base URLs come from
//! [`GoogleConfig`] so tests can point the client at a mock server.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::oauth::ClientCredentials;
use super::traits::{CalendarProvider, EventPage, ProviderError, RefreshedToken, TimeRange};
use crate::model::{BodyTime, EventBody, EventOrigin, EventStatus, EventTime, ExternalEvent};
use crate::storage::GoogleConfig;

const LOCAL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

// === Wire types ===

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_zone: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireExtendedProperties {
    #[serde(default)]
    private: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    id: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    start: Option<WireTime>,
    #[serde(default)]
    end: Option<WireTime>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
    #[serde(default)]
    extended_properties: Option<WireExtendedProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEventList {
    #[serde(default)]
    items: Vec<WireEvent>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEventBody<'a> {
    summary: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    start: WireTime,
    end: WireTime,
    extended_properties: WireExtendedProperties,
}

#[derive(Debug, Deserialize)]
struct WireToken {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn parse_wire_time(time: &WireTime) -> Option<EventTime> {
    if let Some(dt) = &time.date_time {
        return DateTime::<FixedOffset>::parse_from_rfc3339(dt)
            .ok()
            .map(EventTime::DateTime);
    }
    time.date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .map(EventTime::Date)
}

fn to_wire_time(time: &BodyTime, time_zone: &str) -> WireTime {
    match time {
        BodyTime::Date(d) => WireTime {
            date: Some(d.format("%Y-%m-%d").to_string()),
            ..Default::default()
        },
        BodyTime::Local(dt) => WireTime {
            date_time: Some(dt.format(LOCAL_DATETIME_FORMAT).to_string()),
            time_zone: Some(time_zone.to_string()),
            ..Default::default()
        },
    }
}

impl From<WireEvent> for ExternalEvent {
    fn from(wire: WireEvent) -> Self {
        let origin = wire
            .extended_properties
            .as_ref()
            .and_then(|p| EventOrigin::from_properties(&p.private));
        let time_zone = wire.start.as_ref().and_then(|t| t.time_zone.clone());
        ExternalEvent {
            start: wire.start.as_ref().and_then(parse_wire_time),
            end: wire.end.as_ref().and_then(parse_wire_time),
            id: wire.id,
            title: wire.summary.unwrap_or_default(),
            description: wire.description.filter(|d| !d.is_empty()),
            time_zone,
            status: wire
                .status
                .as_deref()
                .map(EventStatus::parse)
                .unwrap_or(EventStatus::Confirmed),
            updated: wire.updated,
            origin,
        }
    }
}

fn to_wire_body(body: &EventBody) -> WireEventBody<'_> {
    WireEventBody {
        summary: &body.summary,
        description: body.description.as_deref(),
        start: to_wire_time(&body.start, &body.time_zone),
        end: to_wire_time(&body.end, &body.time_zone),
        extended_properties: WireExtendedProperties {
            private: body.origin.to_properties(),
        },
    }
}

// === Error classification ===

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success API response onto [`ProviderError`].
async fn classify(resp: Response) -> ProviderError {
    let status = resp.status();
    let delay = retry_after(&resp);
    let message = resp.text().await.unwrap_or_default();

    match status {
        StatusCode::UNAUTHORIZED => ProviderError::Unauthorized,
        StatusCode::NOT_FOUND | StatusCode::GONE => ProviderError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after: delay },
        StatusCode::FORBIDDEN
            if message.contains("rateLimitExceeded") || message.contains("userRateLimitExceeded") =>
        {
            ProviderError::RateLimited { retry_after: delay }
        }
        s if s.is_server_error() => ProviderError::Transient(format!("HTTP {}", s.as_u16())),
        s => ProviderError::Rejected {
            status: s.as_u16(),
            message: truncate(&message, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

fn transport(err: reqwest::Error) -> ProviderError {
    ProviderError::Transient(err.to_string())
}

/// Google Calendar REST client.
pub struct GoogleCalendarClient {
    http: Client,
    api_base: String,
    token_url: String,
    credentials: ClientCredentials,
    page_size: u32,
}

impl GoogleCalendarClient {
    pub fn new(config: &GoogleConfig, credentials: ClientCredentials, page_size: u32) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            credentials,
            page_size,
        }
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!(
            "{}/calendars/{}/events",
            self.api_base,
            urlencoding::encode(calendar_id)
        )
    }

    fn event_url(&self, calendar_id: &str, event_id: &str) -> String {
        format!(
            "{}/{}",
            self.events_url(calendar_id),
            urlencoding::encode(event_id)
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        let resp = request.send().await.map_err(transport)?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(classify(resp).await)
        }
    }

    async fn send_event(&self, request: RequestBuilder) -> Result<ExternalEvent, ProviderError> {
        let wire: WireEvent = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(wire.into())
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarClient {
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        range: TimeRange,
        page_token: Option<&str>,
    ) -> Result<EventPage, ProviderError> {
        let mut query = vec![
            ("timeMin", range.start.to_rfc3339()),
            ("timeMax", range.end.to_rfc3339()),
            ("showDeleted", "true".to_string()),
            ("singleEvents", "true".to_string()),
            ("maxResults", self.page_size.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let request = self
            .http
            .get(self.events_url(calendar_id))
            .bearer_auth(access_token)
            .query(&query);
        let list: WireEventList = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        Ok(EventPage {
            events: list.items.into_iter().map(ExternalEvent::from).collect(),
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        body: &EventBody,
    ) -> Result<ExternalEvent, ProviderError> {
        let request = self
            .http
            .post(self.events_url(calendar_id))
            .bearer_auth(access_token)
            .json(&to_wire_body(body));
        self.send_event(request).await
    }

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        body: &EventBody,
    ) -> Result<ExternalEvent, ProviderError> {
        let request = self
            .http
            .put(self.event_url(calendar_id, event_id))
            .bearer_auth(access_token)
            .json(&to_wire_body(body));
        self.send_event(request).await
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), ProviderError> {
        let request = self
            .http
            .delete(self.event_url(calendar_id, event_id))
            .bearer_auth(access_token);
        self.send(request).await.map(|_| ())
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken, ProviderError> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let resp = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("HTTP {}", status.as_u16())));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after: retry_after(&resp),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        if let Some(error) = body.get("error").and_then(|v| v.as_str()) {
            if error == "invalid_grant" {
                let detail = body
                    .get("error_description")
                    .and_then(|v| v.as_str())
                    .unwrap_or(error);
                return Err(ProviderError::InvalidGrant(detail.to_string()));
            }
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message: error.to_string(),
            });
        }

        let token: WireToken =
            serde_json::from_value(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(RefreshedToken {
            access_token: token.access_token,
            expires_in: token.expires_in.unwrap_or(3600),
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
        })
    }
}
