//! Test doubles shared by unit and integration tests.

mod fixtures;

pub use fixtures::{
    api_request_failed, at, server_message, ConnectPlan, MemoryConnector, MemoryServer,
    MemoryServers,
};
