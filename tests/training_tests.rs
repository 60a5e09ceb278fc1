//! Integration tests for checkpoints, sessions and self-play.

use std::path::PathBuf;
use std::sync::Arc;

use sepia_rl::agents::{
    build_agent, load_agent, Agent, AgentConfig, AgentKind, CrossEntropyConfig,
    PolicyGradientAgent, PolicyGradientConfig, QTableConfig,
};
use sepia_rl::core::{AgentRng, CheckpointError, MatchResult, TickRecord, TickRequest};
use sepia_rl::protocol::{UnitPhase, UnitStep};
use sepia_rl::training::{
    Checkpoint, CheckpointId, CheckpointStore, DirectoryStore, EvaluationSession, MemoryStore,
    OpponentPool, OpponentSelection, SelfPlayConfig, SelfPlaySession, SessionConfig,
    SessionControl, SingleAgentSession, TrainingSession,
};

fn temp_root(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sepia-rl-it-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn play_episode(agent: &mut dyn Agent, features: usize, units: i64) {
    let live: Vec<_> = (0..units)
        .map(|u| TickRecord::new(u, vec![(u % 2) as f64; features], 0.5))
        .collect();
    let batch: Vec<_> = live
        .iter()
        .map(|r| UnitStep::new(r, UnitPhase::AwaitingFirstAction))
        .collect();
    agent.step(&batch).unwrap();
    let end: Vec<_> = (0..units).map(|u| TickRecord::terminal(u, 1.0)).collect();
    let batch: Vec<_> = end
        .iter()
        .map(|r| UnitStep::new(r, UnitPhase::Stepping))
        .collect();
    agent.on_episode_end(&batch).unwrap();
}

/// Weights must match exactly; normalizer moments are rebuilt from the
/// variance and may differ in the last bit.
fn assert_tensors_close(a: &Checkpoint, b: &Checkpoint) {
    assert_eq!(a.tensors.keys().collect::<Vec<_>>(), b.tensors.keys().collect::<Vec<_>>());
    for (name, tensor) in &a.tensors {
        let other = &b.tensors[name];
        assert_eq!(tensor.shape, other.shape, "{name}");
        if name.starts_with("normalizer") {
            for (x, y) in tensor.data.iter().zip(&other.data) {
                assert!((x - y).abs() < 1e-9, "{name}: {x} vs {y}");
            }
        } else {
            assert_eq!(tensor.data, other.data, "{name}");
        }
    }
}

// =============================================================================
// Checkpoints
// =============================================================================

#[test]
fn test_every_agent_round_trips_through_directory_store() {
    let root = temp_root("round-trip");
    let store = DirectoryStore::open(&root).unwrap();

    let configs = [
        AgentConfig::QTable(QTableConfig::default().with_bins(2).with_features(3)),
        AgentConfig::CrossEntropy(CrossEntropyConfig::default().with_population_size(3).with_layers(vec![3, 4, 5])),
        AgentConfig::PolicyGradient(PolicyGradientConfig::default().with_layers(3, 4, 5).with_batches(1, 1)),
        AgentConfig::from_json_str(r#"{"agent": "random"}"#).unwrap(),
    ];

    for config in &configs {
        let mut agent = build_agent(config).unwrap();
        for _ in 0..3 {
            play_episode(agent.as_mut(), 3, 2);
        }
        let saved = agent.save().unwrap();
        let id = store.save(&saved).unwrap();

        let read = store.read(&id).unwrap();
        assert_eq!(read.tensors, saved.tensors);
        assert_eq!(read.meta.agent, saved.meta.agent);
        assert_eq!(read.meta.rng, saved.meta.rng);

        let restored = load_agent(&read).unwrap();
        assert_eq!(restored.kind(), config.kind());
        assert_eq!(restored.iterations(), agent.iterations());
        assert_eq!(restored.epochs(), agent.epochs());
        assert_tensors_close(&restored.save().unwrap(), &saved);
    }

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_policy_gradient_resumes_mid_mini_batch() {
    let root = temp_root("mid-batch");
    let store = DirectoryStore::open(&root).unwrap();
    let config = AgentConfig::PolicyGradient(
        PolicyGradientConfig::default()
            .with_layers(3, 4, 5)
            .with_batches(2, 2),
    );

    let mut original = build_agent(&config).unwrap();
    play_episode(original.as_mut(), 3, 2);
    let id = store.save(&original.save().unwrap()).unwrap();
    let mut resumed = load_agent(&store.read(&id).unwrap()).unwrap();

    // The second episode completes the mini-batch and triggers the update.
    play_episode(original.as_mut(), 3, 2);
    play_episode(resumed.as_mut(), 3, 2);
    assert_eq!(original.epochs(), 1);
    assert_eq!(resumed.epochs(), 1);

    let (a, b) = (original.save().unwrap(), resumed.save().unwrap());
    for name in ["w1", "w2"] {
        for (x, y) in a.tensors[name].data.iter().zip(&b.tensors[name].data) {
            assert!((x - y).abs() < 1e-9, "{name}: {x} vs {y}");
        }
    }

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_checkpoint_folders_are_unique() {
    let root = temp_root("unique");
    let store = DirectoryStore::open(&root).unwrap();
    let ids: Vec<_> = (0..4).map(|_| store.allocate().unwrap()).collect();
    for (i, a) in ids.iter().enumerate() {
        assert!(store.path_of(a).is_dir());
        for b in &ids[i + 1..] {
            assert_ne!(a, b);
        }
    }
    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_shape_mismatch_is_rejected_atomically() {
    let small = PolicyGradientAgent::new(PolicyGradientConfig::default().with_layers(3, 4, 5)).unwrap();
    let mut large = PolicyGradientAgent::new(PolicyGradientConfig::default().with_layers(3, 6, 5)).unwrap();
    let before = large.w1().clone();

    let err = large.load(&small.save().unwrap()).unwrap_err();
    assert!(matches!(err, CheckpointError::ShapeMismatch { .. }));
    assert_eq!(large.w1(), &before);
}

#[test]
fn test_truncated_tensor_is_rejected() {
    let agent = PolicyGradientAgent::new(PolicyGradientConfig::default().with_layers(3, 4, 5)).unwrap();
    let mut checkpoint = agent.save().unwrap();
    if let Some(w2) = checkpoint.tensors.get_mut("w2") {
        w2.data.pop();
        w2.shape = vec![w2.data.len()];
    }
    let err = load_agent(&checkpoint).err().expect("expected load_agent to fail");
    assert!(matches!(err, CheckpointError::ShapeMismatch { ref name, .. } if name == "w2"));
}

#[test]
fn test_checkpoint_of_other_kind_is_rejected() {
    let q = build_agent(&AgentConfig::QTable(QTableConfig::default())).unwrap();
    let mut pg = PolicyGradientAgent::new(PolicyGradientConfig::default()).unwrap();
    let err = pg.load(&q.save().unwrap()).unwrap_err();
    assert!(matches!(err, CheckpointError::AgentMismatch { .. }));
}

// =============================================================================
// Single-agent session
// =============================================================================

#[test]
fn test_single_agent_session_writes_to_disk() {
    let root = temp_root("session");
    let store: Arc<dyn CheckpointStore> = Arc::new(DirectoryStore::open(&root).unwrap());
    let agent = AgentConfig::QTable(QTableConfig::default().with_bins(2).with_features(2));
    let config = SessionConfig::default().with_checkpoint_every(4);
    let mut session = SingleAgentSession::from_config(&agent, store, config).unwrap();

    for tick in 0..8 {
        let request = TickRequest::new(0, vec![TickRecord::new(1, vec![0.0, (tick % 2) as f64], 0.1)]);
        session.on_tick(&request).unwrap();
    }
    session.shutdown().unwrap();

    let saved = std::fs::read_dir(root.join("agents")).unwrap().count();
    assert_eq!(saved, 3);

    let id = session.last_checkpoint().unwrap().clone();
    let checkpoint = session.writer().load(&id).unwrap();
    assert_eq!(checkpoint.kind(), AgentKind::QTable);
    assert_eq!(checkpoint.meta.iterations, 8);

    std::fs::remove_dir_all(&root).unwrap();
}

/// One live tick and the terminal tick, both from the learner's side.
fn session_episode(session: &mut dyn TrainingSession) {
    let live = TickRequest::new(0, vec![TickRecord::new(1, vec![0.0, 1.0], 0.2)]);
    session.on_tick(&live).unwrap();
    let end = TickRequest::new(0, vec![TickRecord::terminal(1, 1.0)]);
    assert!(session.on_tick(&end).unwrap().is_no_action());
}

#[test]
fn test_repeated_match_result_counts_one_game() {
    let random = AgentConfig::from_json_str(r#"{"agent": "random"}"#).unwrap();

    let mut evaluation = EvaluationSession::new(build_agent(&random).unwrap(), 2);
    session_episode(&mut evaluation);
    for _ in 0..2 {
        assert_eq!(
            evaluation.on_match_result(MatchResult::new(0, 0)).unwrap(),
            SessionControl::Continue
        );
    }
    assert_eq!(evaluation.stats().games(), 1);
    session_episode(&mut evaluation);
    assert_eq!(
        evaluation.on_match_result(MatchResult::new(0, 1)).unwrap(),
        SessionControl::Stop
    );

    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let config = SessionConfig::default().with_checkpoint_every(0);
    let mut single = SingleAgentSession::from_config(&random, store, config).unwrap();
    session_episode(&mut single);
    single.on_match_result(MatchResult::new(0, 0)).unwrap();
    single.on_match_result(MatchResult::new(0, 0)).unwrap();
    assert_eq!(single.stats().games(), 1);
}

// =============================================================================
// Opponent pool and self-play
// =============================================================================

#[test]
fn test_pool_without_past_play_always_picks_latest() {
    let store = MemoryStore::new();
    let agent = build_agent(&AgentConfig::from_json_str(r#"{"agent": "random"}"#).unwrap()).unwrap();
    let mut pool = OpponentPool::new(0.0, 0.05);
    let mut rng = AgentRng::new(11);
    for n in 1..=6 {
        pool.push(store.save(&agent.save().unwrap()).unwrap());
        for _ in 0..20 {
            assert_eq!(pool.select(&mut rng), Some(OpponentSelection::Latest(n - 1)));
        }
    }
}

#[test]
fn test_pool_quality_drops_for_beaten_opponent() {
    let mut pool = OpponentPool::new(1.0, 0.1);
    for i in 0..3 {
        pool.push(CheckpointId::new(format!("c{i}")));
    }
    let mut rng = AgentRng::new(5);
    let Some(OpponentSelection::Historical(index)) = pool.select(&mut rng) else {
        panic!("full past-play ratio must pick a historical opponent");
    };
    let before = pool.qualities();
    pool.record_result(true);
    let after = pool.qualities();
    assert!(after[index] < before[index]);
    for i in (0..3).filter(|&i| i != index) {
        assert_eq!(after[i], before[i]);
    }
}

#[test]
fn test_self_play_session_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let agent = AgentConfig::PolicyGradient(
        PolicyGradientConfig::default()
            .with_layers(2, 4, 3)
            .with_batches(1, 2),
    );
    let config = SelfPlayConfig::default()
        .with_snapshot_every(4)
        .with_rotate_every(3)
        .with_past_play_ratio(0.5)
        .with_max_iterations(60);
    let mut session = SelfPlaySession::from_config(&agent, store.clone(), config).unwrap();

    let mut control = SessionControl::Continue;
    let mut matches = 0;
    while control == SessionControl::Continue && matches < 100 {
        for player in 0..2 {
            for t in 0..3 {
                let records = vec![
                    TickRecord::new(1, vec![t as f64, 1.0], 0.1),
                    TickRecord::new(2, vec![1.0, -(t as f64)], -0.1),
                ];
                let response = session.on_tick(&TickRequest::new(player, records)).unwrap();
                assert_eq!(response.actions().map(|a| a.len()), Some(2));
            }
            let end = vec![TickRecord::terminal(2, 1.0), TickRecord::terminal(1, 0.0)];
            assert!(session.on_tick(&TickRequest::new(player, end)).unwrap().is_no_action());
        }
        let winner = matches % 3;
        session.on_match_result(MatchResult::new(0, winner)).unwrap();
        control = session.on_match_result(MatchResult::new(1, winner)).unwrap();
        matches += 1;
    }

    assert_eq!(control, SessionControl::Stop);
    assert!(session.learner().iterations() > 60);
    assert!(session.learner().epochs() > 0);
    assert!(session.opponent().is_eval_mode());
    assert!(session.pool().len() >= 2);

    session.shutdown().unwrap();
    assert_eq!(store.len(), session.pool().len());
}
