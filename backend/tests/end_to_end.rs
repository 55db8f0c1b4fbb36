//! The real router on an ephemeral port, driven by the `link-client` crate.

use link_backend::server::auth::WritePolicy;
use link_backend::server::services::state_store::{MemoryStateStore, StateStore};
use link_backend::{AppState, app_router};
use link_client::{
    ClientSettings, HttpRemoteState, LinkAgent, ManualClock, MemoryStorage, RemoteState,
    StateWrite, TickOutcome,
};
use link_protocol::{CapabilityAction, CapabilitySigner, Stage, StatePutBody};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const WRITE_TOKEN: &str = "bot-secret";
const NOW: i64 = 1_714_557_600_000;

struct Harness {
    store: MemoryStateStore,
    clock: ManualClock,
    agent: LinkAgent,
    bot: HttpRemoteState,
}

async fn spawn(policy: WritePolicy) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local address");
    let store = MemoryStateStore::new();
    let app = app_router(AppState::new(Some(Arc::new(store.clone())), policy));
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("server");
    });

    let settings = ClientSettings {
        state_url: format!("http://{address}/state"),
        ..ClientSettings::default()
    };
    let clock = ManualClock::new(NOW);
    let remote = HttpRemoteState::new(&settings.state_url).expect("client");
    let agent = LinkAgent::new(
        Arc::new(MemoryStorage::new()),
        Arc::new(remote),
        Arc::new(clock.clone()),
        &settings,
    );
    let bot = HttpRemoteState::new(&settings.state_url).expect("bot client");
    Harness {
        store,
        clock,
        agent,
        bot,
    }
}

fn signing_policy() -> WritePolicy {
    let signer = CapabilitySigner::new("capability-secret").expect("signer");
    WritePolicy::new(Some(WRITE_TOKEN), Some(signer))
}

async fn server_stage(h: &Harness) -> Option<Stage> {
    h.store
        .get(h.agent.session_id())
        .await
        .expect("store read")
        .map(|record| record.stage())
}

#[tokio::test]
async fn full_link_with_capabilities() {
    let h = spawn(signing_policy()).await;
    let flow = h.agent.flow();
    assert!(h.agent.election().try_elect());

    flow.enable_two_factor("123456").await.expect("enable 2fa");
    let record = flow.generate_link().await.expect("generate");
    assert_eq!(record.stage, Stage::LINK_GENERATED);
    assert_eq!(flow.last_sync_error(), None);
    assert_eq!(server_stage(&h).await, Some(Stage::LINK_GENERATED));
    assert!(
        flow.record()
            .capabilities
            .contains_key(&CapabilityAction::Finalize)
    );

    // The bot confirms the user and hands out a code.
    let body = StatePutBody {
        stage: Some(Stage::CODE_ISSUED),
        twofa_verified: Some(true),
        linking_code: Some("XY9Z".to_string()),
        actor_tg_user_id: Some(42),
        actor_chat_id: Some(4200),
        ..StatePutBody::default()
    };
    h.bot
        .put(h.agent.session_id(), &StateWrite::bot(WRITE_TOKEN, body))
        .await
        .expect("bot write");

    h.clock.advance(Duration::from_secs(4));
    assert_eq!(h.agent.poller().tick().await, TickOutcome::Advanced);
    assert_eq!(flow.record().stage, Stage::CODE_ISSUED);

    assert!(flow.submit_code("xy9z").await.expect("submit"));
    flow.cancel_timers();
    let record = flow.finalize().await.expect("finalize");
    assert_eq!(record.stage, Stage::LINKED);
    assert_eq!(flow.last_sync_error(), None);
    assert_eq!(server_stage(&h).await, Some(Stage::LINKED));

    flow.send_test_message().await.expect("test message");

    flow.unlink().await.expect("unlink");
    assert_eq!(flow.last_sync_error(), None);
    let stored = h
        .store
        .get(h.agent.session_id())
        .await
        .expect("store read")
        .expect("row");
    assert_eq!(stored.stage(), Stage::UNLINKED);
    assert_eq!(stored.actor_tg_user_id(), Some(42));
    assert!(stored.send_test_at.is_some());
}

#[tokio::test]
async fn finalize_without_capability_is_recorded_as_failure() {
    let h = spawn(signing_policy()).await;
    let flow = h.agent.flow();
    flow.set_stage(5);

    let record = flow.finalize().await.expect("local transition");

    assert_eq!(record.stage, Stage::LINKED);
    let failure = flow.last_sync_error().expect("refused write recorded");
    assert_eq!(failure.action, "finalize");
    assert!(failure.error.contains("401"));
    assert_eq!(server_stage(&h).await, None);
}

#[tokio::test]
async fn lapsed_window_resets_the_server_record() {
    let h = spawn(WritePolicy::new(Some(WRITE_TOKEN), None)).await;
    let flow = h.agent.flow();
    assert!(h.agent.election().try_elect());
    flow.set_stage(2);
    flow.generate_link().await.expect("generate");
    assert_eq!(server_stage(&h).await, Some(Stage::LINK_GENERATED));

    h.clock.advance(Duration::from_secs(15 * 60));
    h.agent.election().try_elect();

    assert_eq!(h.agent.poller().tick().await, TickOutcome::Expired);
    let record = flow.record();
    assert_eq!(record.stage, Stage::TWO_FACTOR_ENABLED);
    assert_eq!(record.expires_at_ms, None);
    assert_eq!(server_stage(&h).await, Some(Stage::TWO_FACTOR_ENABLED));
}

#[tokio::test]
async fn unauthorized_bot_write_surfaces_status() {
    let h = spawn(WritePolicy::new(Some(WRITE_TOKEN), None)).await;

    let err = h
        .bot
        .put(
            h.agent.session_id(),
            &StateWrite::bot("wrong", StatePutBody::with_stage(Stage::LINKED)),
        )
        .await
        .expect_err("refused");

    assert_eq!(err.status(), Some(401));
    assert_eq!(h.bot.get(h.agent.session_id()).await.expect("get"), None);
}
