use std::error::Error;
use std::time::{Duration, Instant};

use taskdag::dag::{with_timeout as deadline, DagError, State};
use taskdag::engine::{Action, Engine, EngineOptions};
use taskdag_test_utils::recorder::{Behaviour, Recorder};
use taskdag_test_utils::{events_until, init_tracing, with_timeout};
use tokio_util::sync::CancellationToken;

type TestResult = Result<(), Box<dyn Error>>;

fn engine() -> Engine {
    Engine::new(EngineOptions::default())
}

/// Poll until `cond` holds; panics after 5 seconds.
async fn wait_for(cond: impl Fn() -> bool) {
    with_timeout(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

#[tokio::test]
async fn timed_pause_before_run_delays_every_step() -> TestResult {
    init_tracing();
    let engine = engine();
    let (mut events, _) = engine.subscribe_event()?;
    let rec = Recorder::new();
    let g = engine.graph("t");
    g.add_vertex(&rec.vertex("a", Behaviour::Succeed))?;

    g.pause("200ms")?;
    let started = Instant::now();
    with_timeout(g.run(CancellationToken::new())).await?;

    assert!(started.elapsed() >= Duration::from_millis(190));
    let seen = events_until(&mut events, "end task t").await;
    assert!(seen.contains(&"pause task t".to_string()));
    assert!(seen.contains(&"step a paused because task t is paused".to_string()));
    assert!(seen.contains(&"resumed step a in task t".to_string()));
    Ok(())
}

#[tokio::test]
async fn manual_pause_waits_for_resume() -> TestResult {
    let engine = engine();
    let rec = Recorder::new();
    let g = engine.graph("t");
    g.add_vertex(&rec.vertex("a", Behaviour::Succeed))?;

    engine.manage_task("t", &Action::Pause("0".into()))?;
    let run = {
        let g = g.clone();
        tokio::spawn(async move { g.run(CancellationToken::new()).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!run.is_finished());
    assert!(!rec.was_started("a"));
    assert_eq!(g.state(), State::Paused);

    engine.manage_task("t", &Action::Resume)?;
    with_timeout(run).await??;
    assert!(rec.was_started("a"));
    Ok(())
}

#[tokio::test]
async fn paused_step_holds_back_only_its_branch() -> TestResult {
    let engine = engine();
    let rec = Recorder::new();
    let g = engine.graph("t");
    let held = rec.vertex("held", Behaviour::Succeed);
    let after = rec.vertex("after", Behaviour::Succeed);
    let free = rec.vertex("free", Behaviour::Succeed);
    g.add_vertex(&after)?;
    g.add_vertex(&free)?;
    after.with_deps([&held])?;

    engine.manage_step("t", "held", &Action::Pause("0".into()))?;
    let run = {
        let g = g.clone();
        tokio::spawn(async move { g.run(CancellationToken::new()).await })
    };

    wait_for(|| rec.was_started("free")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!rec.was_started("held"));
    assert!(!rec.was_started("after"));

    engine.manage_step("t", "held", &Action::Resume)?;
    with_timeout(run).await??;
    assert!(rec.ended_before_start("held", "after"));
    Ok(())
}

#[tokio::test]
async fn running_step_cannot_be_paused() -> TestResult {
    let engine = engine();
    let rec = Recorder::new();
    let g = engine.graph("t");
    g.add_vertex(&rec.vertex("a", Behaviour::BlockUntilCancelled))?;

    let run = {
        let g = g.clone();
        tokio::spawn(async move { g.run(CancellationToken::new()).await })
    };
    wait_for(|| rec.was_started("a")).await;

    let err = engine
        .manage_step("t", "a", &Action::Pause(String::new()))
        .expect_err("step is running");
    assert!(matches!(err, DagError::Running));

    g.kill()?;
    let result = with_timeout(run).await?;
    assert!(result.expect_err("killed").is_force_kill());
    Ok(())
}

#[tokio::test]
async fn kill_cascades_to_every_step() -> TestResult {
    init_tracing();
    let engine = engine();
    let (mut events, _) = engine.subscribe_event()?;
    let rec = Recorder::new();
    let g = engine.graph("t");
    let a = rec.vertex("a", Behaviour::BlockUntilCancelled);
    let b = rec.vertex("b", Behaviour::BlockUntilCancelled);
    let c = rec.vertex("c", Behaviour::Succeed);
    g.add_vertex(&c)?;
    g.add_vertex(&b)?;
    c.with_deps([&a])?;

    let run = {
        let g = g.clone();
        tokio::spawn(async move { g.run(CancellationToken::new()).await })
    };
    wait_for(|| rec.was_started("a") && rec.was_started("b")).await;

    engine.manage_task("t", &Action::Kill)?;
    let err = with_timeout(run).await?.expect_err("killed");

    assert!(err.is_force_kill());
    let mut cancelled = rec.cancelled();
    cancelled.sort();
    assert_eq!(cancelled, vec!["a", "b"]);
    assert!(!rec.was_started("c"));

    let seen = events_until(&mut events, "skipped step c in task t").await;
    assert!(seen.contains(&"kill task t".to_string()));

    // A killed graph stays dead.
    let again = g.run(CancellationToken::new()).await.expect_err("still killed");
    assert!(again.is_force_kill());
    Ok(())
}

#[tokio::test]
async fn killing_one_step_leaves_siblings_running() -> TestResult {
    let engine = engine();
    let rec = Recorder::new();
    let g = engine.graph("t");
    let doomed = rec.vertex("doomed", Behaviour::BlockUntilCancelled);
    let sibling = rec.vertex("sibling", Behaviour::Sleep(Duration::from_millis(100)));
    g.add_vertex(&doomed)?;
    g.add_vertex(&sibling)?;

    let run = {
        let g = g.clone();
        tokio::spawn(async move { g.run(CancellationToken::new()).await })
    };
    wait_for(|| rec.was_started("doomed")).await;

    engine.manage_step("t", "doomed", &Action::Kill)?;
    let err = with_timeout(run).await?.expect_err("doomed fails");

    assert_eq!(err.failed_vertices(), vec!["doomed"]);
    assert!(err.is_force_kill());
    assert!(!err.is_canceled());
    assert!(rec.finished().contains(&"sibling".to_string()));
    Ok(())
}

#[tokio::test]
async fn caller_cancellation_is_not_a_kill() -> TestResult {
    let engine = engine();
    let rec = Recorder::new();
    let g = engine.graph("t");
    let a = rec.vertex("a", Behaviour::Sleep(Duration::from_millis(100)));
    let b = rec.vertex("b", Behaviour::Succeed);
    g.add_vertex(&b)?;
    b.with_deps([&a])?;

    let caller = CancellationToken::new();
    let run = {
        let g = g.clone();
        let caller = caller.clone();
        tokio::spawn(async move { g.run(caller).await })
    };
    wait_for(|| rec.was_started("a")).await;
    caller.cancel();

    let err = with_timeout(run).await?.expect_err("cancelled");
    assert!(err.is_canceled());
    assert!(!err.is_force_kill());
    assert!(!rec.was_started("b"));
    Ok(())
}

#[tokio::test]
async fn deadline_cancels_the_run() -> TestResult {
    let engine = engine();
    let rec = Recorder::new();
    let g = engine.graph("t");
    let a = rec.vertex("a", Behaviour::BlockUntilCancelled);
    g.add_vertex(&a)?;

    let parent = CancellationToken::new();
    let token = deadline(&parent, Duration::from_millis(50));
    let err = with_timeout(g.run(token)).await.expect_err("timed out");

    assert_eq!(rec.cancelled(), vec!["a"]);
    assert_eq!(err.failed_vertices(), vec!["a"]);
    assert!(err.is_canceled());
    assert!(!err.is_force_kill());
    assert!(!parent.is_cancelled());
    Ok(())
}

#[tokio::test]
async fn rerun_of_killed_graph_is_not_registered() -> TestResult {
    let engine = engine();
    let rec = Recorder::new();
    let g = engine.graph("t");
    g.add_vertex(&rec.vertex("a", Behaviour::Succeed))?;
    g.kill()?;

    let run = {
        let g = g.clone();
        tokio::spawn(async move { g.run(CancellationToken::new()).await })
    };
    tokio::task::yield_now().await;
    assert!(matches!(
        engine.registry().graph_manager("t"),
        Err(DagError::NotFound)
    ));

    let err = with_timeout(run).await?.expect_err("still killed");
    assert!(err.is_force_kill());
    assert!(!rec.was_started("a"));
    Ok(())
}

#[tokio::test]
async fn wait_resume_returns_after_resume() -> TestResult {
    let engine = engine();
    let g = engine.graph("t");
    g.pause("")?;

    let waiter = {
        let g = g.clone();
        tokio::spawn(async move { g.wait_resume().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    g.resume();
    with_timeout(waiter).await?;
    assert_eq!(g.state(), State::Resume);
    Ok(())
}
