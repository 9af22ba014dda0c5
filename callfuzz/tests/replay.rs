use callfuzz::custom::param_mutator::mutate_invocation;
use callfuzz::generator::Generator;
use callfuzz::invocation::Invocation;
use callfuzz::replay::{JsonLinesReplayLog, reconstruct};
use callfuzz::session::{SeedSession, SessionSettings};
use callfuzz::supervisor::{Supervisor, SupervisorSettings};
use callfuzz::value::Value;
use callfuzz::worker::ProcessLauncher;
use std::time::Duration;

const INITIAL_STATE: u64 = 0x00C0_FFEE;

fn seed() -> Invocation {
    Invocation::positional("pkg.add3", vec![Value::Int(10), Value::Int(-4), Value::Int(77)])
}

/// The 50 mutants a session starting from `INITIAL_STATE` produces, with the
/// state each one was derived from.
fn expected_mutants() -> Vec<(u64, Invocation)> {
    let mut generator = Generator::new(INITIAL_STATE);
    (0..50)
        .map(|_| {
            let state = generator.state();
            (state, mutate_invocation(&mut generator, &seed()).unwrap())
        })
        .collect()
}

#[test]
fn seventeenth_of_fifty_mutants_is_rebuilt_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("replay.jsonl");

    let mut supervisor = Supervisor::new(
        ProcessLauncher::new("true", Vec::<String>::new()),
        SupervisorSettings {
            poll_interval: Duration::from_millis(5),
            ..SupervisorSettings::default()
        },
    );
    let mut log = JsonLinesReplayLog::open(&log_path).unwrap();
    let mut generator = Generator::new(INITIAL_STATE);
    let settings = SessionSettings {
        mutants_per_seed: 50,
        max_attempts: 3,
        execution_timeout: Duration::from_secs(5),
    };
    let report = SeedSession::new(&mut supervisor, &mut log, &mut generator, settings)
        .fuzz(&seed())
        .unwrap();
    assert_eq!(report.outcomes.len(), 50);
    drop(log);

    let records = JsonLinesReplayLog::load(&log_path).unwrap();
    assert_eq!(records.len(), 50);
    let record = &records[16];
    assert_eq!(record.ordinal, 16);

    let expected = expected_mutants();
    assert_eq!(record.generator_state, expected[16].0);

    // Whatever the generator was doing before, restoring the state is enough.
    let mut unrelated = Generator::new(1);
    for _ in 0..1000 {
        unrelated.below(97);
    }
    let rebuilt = reconstruct(&seed(), record, &mut unrelated).unwrap();
    assert_eq!(rebuilt, expected[16].1);
}

#[test]
fn replay_is_stable_across_repeated_reconstruction() {
    let expected = expected_mutants();
    let (state, mutant) = &expected[16];
    for _ in 0..3 {
        let mut generator = Generator::default();
        generator.set_state(*state);
        assert_eq!(&mutate_invocation(&mut generator, &seed()).unwrap(), mutant);
    }
}
