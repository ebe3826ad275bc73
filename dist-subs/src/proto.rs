//! Wire entities exchanged on the admin, client, and peer channels.
//!
//! These are Protocol Buffers messages described with `prost` derives
//! instead of a build script, so the crate needs no `protoc` at build
//! time. Field tags are part of the wire contract and must not change.

use std::time::{SystemTime, UNIX_EPOCH};

/// Demand carried by a configuration reply.
pub const DEMAND_START: &str = "STRT";
/// Demand carried by a replication envelope.
pub const DEMAND_SYNC: &str = "SYNC";
/// Demand asking a node for its total subscriber count.
pub const DEMAND_CAPACITY: &str = "CPCTY";

/// Subscriber lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    /// Registration intent.
    Subs = 0,
    /// Active subscriber.
    Onln = 1,
    Offl = 2,
    Del = 3,
    /// Failure marker returned to clients.
    Unknown = 4,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Status::Subs => "SUBS",
            Status::Onln => "ONLN",
            Status::Offl => "OFFL",
            Status::Del => "DEL",
            Status::Unknown => "UNKNOWN",
        }
    }
}

/// Generic acknowledgement value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Response {
    Yep = 0,
    Nop = 1,
    Unknown = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Subscriber {
    #[prost(int32, tag = "1")]
    pub id: i32,
    #[prost(enumeration = "Status", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub name_surname: String,
    #[prost(int64, tag = "4")]
    pub start_date: i64,
    #[prost(int64, tag = "5")]
    pub last_accessed: i64,
    #[prost(string, repeated, tag = "6")]
    pub interests: Vec<String>,
}

impl Subscriber {
    /// Builds a registration request; the node assigns id and timestamps.
    pub fn registration(name_surname: impl Into<String>, interests: Vec<String>) -> Self {
        Self {
            id: 0,
            status: Status::Subs as i32,
            name_surname: name_surname.into(),
            start_date: 0,
            last_accessed: 0,
            interests,
        }
    }

    /// True only for a status field that decodes to exactly `SUBS`.
    ///
    /// The generated `status()` getter folds unrecognised values into the
    /// default variant, which is `SUBS`, so it cannot be used for this check.
    pub fn is_registration(&self) -> bool {
        matches!(Status::try_from(self.status), Ok(Status::Subs))
    }

    /// Copy of this record carrying the failure marker.
    pub fn rejected(&self) -> Self {
        let mut echo = self.clone();
        echo.set_status(Status::Unknown);
        echo
    }
}

/// Subscriber count reported by a node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Capacity {
    #[prost(int32, tag = "1")]
    pub server_id: i32,
    #[prost(int32, tag = "2")]
    pub server_status: i32,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
}

impl Capacity {
    pub fn new(server_id: i32, server_status: usize) -> Self {
        Self {
            server_id,
            server_status: i32::try_from(server_status).unwrap_or(i32::MAX),
            timestamp: epoch_millis(),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Configuration {
    #[prost(int32, tag = "1")]
    pub server_id: i32,
    #[prost(int32, tag = "2")]
    pub fault_tolerance_level: i32,
    #[prost(string, tag = "3")]
    pub method: String,
}

impl Configuration {
    pub fn start(server_id: i32, fault_tolerance_level: i32) -> Self {
        Self {
            server_id,
            fault_tolerance_level,
            method: DEMAND_START.to_string(),
        }
    }
}

/// Control and replication envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(string, tag = "1")]
    pub demand: String,
    #[prost(enumeration = "Response", tag = "2")]
    pub response: i32,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
}

impl Message {
    pub fn new(demand: impl Into<String>, response: Response) -> Self {
        Self {
            demand: demand.into(),
            response: response as i32,
            timestamp: epoch_millis(),
        }
    }

    pub fn sync() -> Self {
        Self::new(DEMAND_SYNC, Response::Yep)
    }

    pub fn capacity_query() -> Self {
        Self::new(DEMAND_CAPACITY, Response::Unknown)
    }

    pub fn is_sync(&self) -> bool {
        self.demand == DEMAND_SYNC && self.response() == Response::Yep
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
