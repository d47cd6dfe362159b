//! Attendance verification and session orchestration.
//!
//! An authority opens a time-boxed session for a group; members prove
//! presence by face, rotating QR code or NFC tag, optionally constrained
//! by a geofence; observers follow a session's roster live.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod state;

pub mod crypto {
    pub mod token;
}

pub mod models {
    pub mod event;
    pub mod principal;
    pub mod record;
    pub mod session;
}

pub mod repositories {
    pub mod groups;
    pub mod identities;
    pub mod memory;
    pub mod records;
}

pub mod services {
    pub mod attendance;
    pub mod events;
    pub mod face;
    pub mod geo;
    pub mod identity;
    pub mod qr;
    pub mod sessions;
}

pub mod handlers {
    pub mod attendance;
    pub mod events;
    pub mod health;
    pub mod members;
    pub mod response;
    pub mod sessions;
}

pub mod middleware_layer {
    pub mod auth;
    pub mod rate_limit;
}

pub mod validation {
    pub mod attendance;
}
