#![allow(dead_code)]

use axum::http::{HeaderName, HeaderValue};
use axum_test::TestServer;
use link_backend::server::auth::WritePolicy;
use link_backend::server::services::state_store::MemoryStateStore;
use link_backend::{AppState, app_router};
use link_protocol::CapabilitySigner;
use std::sync::Arc;

pub const WRITE_TOKEN: &str = "bot-secret";
pub const CAPABILITY_SECRET: &str = "capability-secret";

pub struct TestApp {
    pub server: TestServer,
    pub store: MemoryStateStore,
}

pub fn spawn_app() -> TestApp {
    spawn_with_policy(WritePolicy::new(Some(WRITE_TOKEN), None))
}

pub fn spawn_signing_app() -> TestApp {
    let signer = CapabilitySigner::new(CAPABILITY_SECRET).expect("signer");
    spawn_with_policy(WritePolicy::new(Some(WRITE_TOKEN), Some(signer)))
}

pub fn spawn_with_policy(policy: WritePolicy) -> TestApp {
    let store = MemoryStateStore::new();
    let state = AppState::new(Some(Arc::new(store.clone())), policy);
    spawn_with_state(state, store)
}

pub fn spawn_with_state(state: AppState, store: MemoryStateStore) -> TestApp {
    let server = TestServer::new(app_router(state).into_make_service()).expect("test server");
    TestApp { server, store }
}

pub fn header(name: &'static str) -> HeaderName {
    HeaderName::from_static(name)
}

pub fn value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).expect("header value")
}

pub fn bearer() -> HeaderValue {
    value(&format!("Bearer {WRITE_TOKEN}"))
}
