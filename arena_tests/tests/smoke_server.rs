use std::time::Duration;

use arena_server::server::bind_ephemeral;

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (server, _cfg) = bind_ephemeral(64).await?;
    server.spawn_bots(2)?;
    let session = server.session();
    server
        .run_until(tokio::time::sleep(Duration::from_millis(200)))
        .await?;

    let env = session.lock().unwrap();
    assert!(env.lifecycle().tick_count() >= 3);
    assert!(env.is_closed());
    Ok(())
}
