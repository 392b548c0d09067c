use std::sync::Arc;
use std::time::Duration;

use abft::{
    acs::{coordinator::Coordinator, AcsOutput},
    ciphersuite::Secp256k1,
    config::AcsConfig,
    generic_ec::{curves::Secp256k1 as E, Point, SecretScalar},
    key::default_eval_points,
    window::InstanceWindow,
    DkShare,
};
use abft_tests::{
    init_tracing, key_shares, node_ids, pump, Endpoint, NetworkOptions, TestNetwork,
};
use test_case::test_case;
use tokio::sync::oneshot;

fn config() -> AcsConfig {
    AcsConfig::default()
        .with_resend_period(Duration::from_millis(20))
        .with_past_instances(2)
        .with_future_instances(3)
}

fn coordinators(
    n: u16,
    options: NetworkOptions,
    rng: &mut rand_dev::DevRng,
) -> Vec<Coordinator<Secp256k1, Endpoint>> {
    let shares = key_shares::<E>(rng, n, abft::key::max_faulty(n.into()) as u16 + 1).unwrap();
    let members = node_ids(n.into());
    let (network, inboxes) = TestNetwork::new(n.into(), options, 7);
    shares
        .into_iter()
        .zip(inboxes)
        .enumerate()
        .map(|(i, (dk, inbox))| {
            let coordinator =
                Coordinator::new(members.clone(), dk, network.endpoint(i as u16), config())
                    .unwrap();
            let receiver = coordinator.clone();
            pump(inbox, move |from, payload| receiver.receive(from, payload));
            coordinator
        })
        .collect()
}

fn ask(
    coordinator: &Coordinator<Secp256k1, Endpoint>,
    value: Vec<u8>,
    session_id: u64,
    state_index: u32,
) -> oneshot::Receiver<AcsOutput> {
    let (tx, rx) = oneshot::channel();
    coordinator
        .run_acs_consensus(value, session_id, state_index, move |output| {
            let _ = tx.send(output);
        })
        .unwrap();
    rx
}

#[test_case(NetworkOptions::default(); "reliable")]
#[test_case(NetworkOptions { drop_rate: 0.2, max_delay: Some(Duration::from_millis(10)) }; "lossy")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consecutive_sessions_agree(options: NetworkOptions) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let coordinators = coordinators(4, options, &mut rng);

    for state_index in 1..=3u32 {
        let outputs = coordinators
            .iter()
            .enumerate()
            .map(|(i, c)| ask(c, format!("{i}@{state_index}").into_bytes(), 1, state_index))
            .collect::<Vec<_>>();
        let outputs = tokio::time::timeout(
            Duration::from_secs(60),
            futures::future::try_join_all(outputs),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(outputs.iter().all(|o| *o == outputs[0]));
        assert!(outputs[0].len() >= 3);
        for (j, value) in &outputs[0] {
            assert_eq!(value, format!("{j}@{state_index}").as_bytes());
        }
        for c in &coordinators {
            assert_eq!(c.current_state_index(), state_index);
        }
    }
}

#[tokio::test]
async fn sessions_with_different_ids_are_independent() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let coordinators = coordinators(4, NetworkOptions::default(), &mut rng);

    let mut first = vec![];
    let mut second = vec![];
    for c in &coordinators {
        first.push(ask(c, b"a".to_vec(), 1, 1));
        second.push(ask(c, b"b".to_vec(), 2, 1));
    }
    let first = futures::future::try_join_all(first).await.unwrap();
    let second = futures::future::try_join_all(second).await.unwrap();
    assert!(first.iter().flat_map(|o| o.values()).all(|v| v == b"a"));
    assert!(second.iter().flat_map(|o| o.values()).all(|v| v == b"b"));
}

#[tokio::test]
async fn asking_twice_is_rejected() {
    let mut rng = rand_dev::DevRng::new();
    let coordinators = coordinators(4, NetworkOptions::default(), &mut rng);
    let c = &coordinators[0];

    let _rx = ask(c, b"value".to_vec(), 1, 1);
    let err = c
        .run_acs_consensus(b"value".to_vec(), 1, 1, |_| ())
        .unwrap_err();
    assert!(err.is_duplicate());
}

#[tokio::test]
async fn invalid_proposal_is_rejected_and_can_be_retried() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let coordinators = coordinators(4, NetworkOptions::default(), &mut rng);

    let err = coordinators[0]
        .run_acs_consensus(vec![], 1, 1, |_| ())
        .unwrap_err();
    assert!(err.is_invalid_proposal());
    let too_large = vec![1u8; config().max_message_size + 1];
    let err = coordinators[0]
        .run_acs_consensus(too_large, 1, 1, |_| ())
        .unwrap_err();
    assert!(err.is_invalid_proposal());

    // Rejected proposal doesn't count as asked
    let outputs = coordinators
        .iter()
        .map(|c| ask(c, b"value".to_vec(), 1, 1))
        .collect::<Vec<_>>();
    let outputs = tokio::time::timeout(
        Duration::from_secs(60),
        futures::future::try_join_all(outputs),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(outputs.iter().all(|o| *o == outputs[0]));
    assert!(outputs[0].len() >= 3);
}

#[tokio::test]
async fn session_behind_window_is_rejected() {
    let mut rng = rand_dev::DevRng::new();
    let coordinators = coordinators(4, NetworkOptions::default(), &mut rng);
    let c = &coordinators[0];

    let _rx = ask(c, b"value".to_vec(), 1, 10);
    let err = c
        .run_acs_consensus(b"value".to_vec(), 1, 7, |_| ())
        .unwrap_err();
    assert!(err.is_out_of_window());
    // Still within the window
    let _rx = ask(c, b"value".to_vec(), 1, 8);
}

#[tokio::test]
async fn closed_coordinator_rejects_everything() {
    let mut rng = rand_dev::DevRng::new();
    let coordinators = coordinators(4, NetworkOptions::default(), &mut rng);
    let c = &coordinators[0];

    let _rx = ask(c, b"value".to_vec(), 1, 1);
    assert_eq!(c.active_sessions(), 1);
    c.close();
    assert_eq!(c.active_sessions(), 0);
    assert!(c.run_acs_consensus(b"value".to_vec(), 1, 2, |_| ()).is_err());
}

#[tokio::test]
async fn single_member_decides_own_value() {
    let mut rng = rand_dev::DevRng::new();
    let secret = SecretScalar::<E>::random(&mut rng);
    let public = Point::generator() * &secret;
    let dk = DkShare::new(0, 1, public, vec![public], default_eval_points(1), secret).unwrap();
    let (network, _inboxes) = TestNetwork::new(1, NetworkOptions::default(), 0);
    let coordinator = Coordinator::<Secp256k1, _>::new(
        node_ids(1),
        Arc::new(dk),
        network.endpoint(0),
        config(),
    )
    .unwrap();

    let output = ask(&coordinator, b"alone".to_vec(), 5, 5).await.unwrap();
    assert_eq!(output, AcsOutput::from([(0, b"alone".to_vec())]));
}

#[test]
fn window_reaps_old_instances() {
    let mut window = InstanceWindow::<u64, &str>::new(2, 3);
    assert!(window.in_range(0));
    assert!(window.in_range(3));
    assert!(!window.in_range(4));

    window.get_or_try_insert_with(1, 0, || "one").unwrap();
    window.get_or_try_insert_with(3, 0, || "three").unwrap();
    assert!(window.get_or_try_insert_with(4, 0, || "four").is_err());

    let reaped = window.advance(4);
    assert_eq!(reaped, vec![((1, 0), "one")]);
    assert_eq!(window.current(), 4);
    assert_eq!(window.get(3, &0), Some(&"three"));
    assert!(window.get_or_try_insert_with(7, 0, || "seven").is_ok());
    assert!(window.get_or_try_insert_with(1, 0, || "one").is_err());

    // Moving backwards doesn't change anything
    assert!(window.advance(2).is_empty());
    assert_eq!(window.current(), 4);
    assert_eq!(window.len(), 2);
}
