//! Keepalive policy for servers and clients.
//!
//! Every duration uses zero to mean "not set". [`ServerKeepAlive::with_defaults`]
//! and [`ClientKeepAlive::with_defaults`] replace unset values with the
//! role-specific defaults below and leave explicit values alone. Servers are
//! quick to reclaim idle connections; clients are patient before declaring a
//! server dead.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum interval a client must wait between pings.
pub const DEFAULT_SERVER_MIN_TIME: Duration = Duration::from_secs(5);
pub const DEFAULT_SERVER_MAX_CONNECTION_AGE: Duration = Duration::from_secs(30);
pub const DEFAULT_SERVER_MAX_CONNECTION_IDLE: Duration = Duration::from_secs(15);
/// Interval between server-initiated pings.
pub const DEFAULT_SERVER_TIME: Duration = Duration::from_secs(5);
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_CLIENT_TIME: Duration = Duration::from_secs(10);
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(20);
/// Shortest ping interval a server will use.
pub const MIN_SERVER_TIME: Duration = Duration::from_secs(1);
/// Shortest ping interval a client will use. Keeps clients clear of the
/// server's `min_time` so they are not struck for pinging too often.
pub const MIN_CLIENT_TIME: Duration = Duration::from_secs(10);

/// How the server polices pings sent by clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementPolicy {
    /// Pings arriving more often than this count as abuse.
    #[serde(rename = "min_time_ms", with = "millis")]
    pub min_time: Duration,
    /// Allow pings while the connection has no active calls.
    pub permit_without_stream: bool,
}

/// Connection lifetime and server-side ping settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerParameters {
    #[serde(rename = "max_connection_age_ms", with = "millis")]
    pub max_connection_age: Duration,
    #[serde(rename = "max_connection_idle_ms", with = "millis")]
    pub max_connection_idle: Duration,
    #[serde(rename = "time_ms", with = "millis")]
    pub time: Duration,
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
}

impl ServerParameters {
    /// Interval the server actually pings at: `time`, but never below
    /// [`MIN_SERVER_TIME`].
    pub fn ping_interval(&self) -> Duration {
        self.time.max(MIN_SERVER_TIME)
    }
}

/// Server keepalive configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerKeepAlive {
    pub enforcement_policy: EnforcementPolicy,
    pub server_parameters: ServerParameters,
}

impl ServerKeepAlive {
    pub fn with_defaults(mut self) -> Self {
        self.apply_defaults();
        self
    }

    pub fn apply_defaults(&mut self) {
        fill(
            &mut self.enforcement_policy.min_time,
            DEFAULT_SERVER_MIN_TIME,
        );

        let params = &mut self.server_parameters;
        fill(
            &mut params.max_connection_age,
            DEFAULT_SERVER_MAX_CONNECTION_AGE,
        );
        fill(
            &mut params.max_connection_idle,
            DEFAULT_SERVER_MAX_CONNECTION_IDLE,
        );
        fill(&mut params.time, DEFAULT_SERVER_TIME);
        fill(&mut params.timeout, DEFAULT_SERVER_TIMEOUT);
    }
}

/// Client-side ping settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientParameters {
    /// Keep pinging while no calls are active.
    pub permit_without_stream: bool,
    #[serde(rename = "time_ms", with = "millis")]
    pub time: Duration,
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
}

impl ClientParameters {
    /// Interval the client actually pings at: `time`, but never below
    /// [`MIN_CLIENT_TIME`].
    pub fn ping_interval(&self) -> Duration {
        self.time.max(MIN_CLIENT_TIME)
    }
}

/// Client keepalive configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientKeepAlive {
    pub client_parameters: ClientParameters,
}

impl ClientKeepAlive {
    pub fn with_defaults(mut self) -> Self {
        self.apply_defaults();
        self
    }

    pub fn apply_defaults(&mut self) {
        fill(&mut self.client_parameters.time, DEFAULT_CLIENT_TIME);
        fill(&mut self.client_parameters.timeout, DEFAULT_CLIENT_TIMEOUT);
    }
}

fn fill(value: &mut Duration, default: Duration) {
    if value.is_zero() {
        *value = default;
    }
}

/// Serialize a [`Duration`] as whole milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Same as [`millis`], for optional durations.
pub(crate) mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
