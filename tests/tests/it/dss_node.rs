use std::sync::Arc;
use std::time::Duration;

use abft::{
    ciphersuite::Secp256k1,
    config::DssConfig,
    dss::node::DssNode,
    generic_ec::curves::Secp256k1 as E,
    key::max_faulty,
    signature::Signature,
    DkShare, PeerIndex,
};
use abft_tests::{
    chacha, committee, init_tracing, key_shares, pump, Endpoint, NetworkOptions, TestNetwork,
};
use test_case::test_case;
use tokio::sync::{mpsc, oneshot};

type C = Secp256k1;

fn config() -> DssConfig {
    DssConfig::default()
        .with_tick_period(Duration::from_millis(10))
        .with_resend_period(Duration::from_millis(20))
        .with_past_instances(1)
        .with_future_instances(2)
}

struct Setup {
    nodes: Vec<DssNode<C, Endpoint>>,
    shares: Vec<Arc<DkShare<E>>>,
}

fn setup(
    n: u16,
    t: u16,
    options: NetworkOptions,
    config: DssConfig,
    rng: &mut rand_dev::DevRng,
) -> Setup {
    let (identities, committee) = committee::<C>(rng, n.into());
    let shares = key_shares::<E>(rng, n, t).unwrap();
    let (network, inboxes) = TestNetwork::new(n.into(), options, 11);
    let nodes = identities
        .into_iter()
        .zip(inboxes)
        .enumerate()
        .map(|(i, (identity, inbox))| {
            let node = DssNode::new(
                identity,
                committee.clone(),
                network.endpoint(i as u16),
                config.clone(),
                chacha(rng),
            )
            .unwrap();
            let receiver = node.clone();
            pump(inbox, move |from, payload| receiver.receive(from, payload));
            node
        })
        .collect();
    Setup { nodes, shares }
}

/// Starts instance `index` of series `key` at node `i`
fn start(
    setup: &Setup,
    i: usize,
    key: &[u8],
    index: u32,
    proposals: &mpsc::UnboundedSender<(PeerIndex, Vec<PeerIndex>)>,
) -> oneshot::Receiver<Signature<C>> {
    let (sig_tx, sig_rx) = oneshot::channel();
    let proposals = proposals.clone();
    setup.nodes[i]
        .start(
            key,
            index,
            setup.shares[i].clone(),
            move |indexes| {
                let _ = proposals.send((i as PeerIndex, indexes));
            },
            move |signature| {
                let _ = sig_tx.send(signature);
            },
        )
        .unwrap();
    sig_rx
}

/// Collects proposals of all nodes, decides proposals of the first $n-f$ members
async fn decide(
    setup: &Setup,
    key: &[u8],
    index: u32,
    proposals: &mut mpsc::UnboundedReceiver<(PeerIndex, Vec<PeerIndex>)>,
    message: &[u8],
) {
    let n = setup.nodes.len();
    let mut received = vec![None; n];
    for _ in 0..n {
        let (i, indexes) = proposals.recv().await.unwrap();
        received[usize::from(i)] = Some(indexes);
    }
    let decided = received
        .into_iter()
        .take(n - max_faulty(n))
        .map(Option::unwrap)
        .collect::<Vec<_>>();
    for node in &setup.nodes {
        node.decided_index_proposals(key, index, decided.clone(), message.to_vec())
            .unwrap();
    }
}

#[test_case(4, 3, NetworkOptions::default(); "t3n4")]
#[test_case(4, 3, NetworkOptions { drop_rate: 0.1, max_delay: Some(Duration::from_millis(5)) }; "t3n4 lossy")]
#[test_case(10, 7, NetworkOptions::default(); "t7n10")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nodes_sign_message(n: u16, t: u16, options: NetworkOptions) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let setup = setup(n, t, options, config(), &mut rng);
    let (proposals_tx, mut proposals_rx) = mpsc::unbounded_channel();

    // Last node joins late: messages sent to it meanwhile are buffered
    let mut signatures = (0..setup.nodes.len() - 1)
        .map(|i| start(&setup, i, b"chain", 1, &proposals_tx))
        .collect::<Vec<_>>();
    tokio::time::sleep(Duration::from_millis(50)).await;
    signatures.push(start(&setup, setup.nodes.len() - 1, b"chain", 1, &proposals_tx));

    let message = b"block #42";
    tokio::time::timeout(
        Duration::from_secs(60),
        decide(&setup, b"chain", 1, &mut proposals_rx, message),
    )
    .await
    .unwrap();

    let signatures = tokio::time::timeout(
        Duration::from_secs(60),
        futures::future::try_join_all(signatures),
    )
    .await
    .unwrap()
    .unwrap();
    let public_key = setup.shares[0].shared_public_key();
    for signature in &signatures {
        assert_eq!(signature, &signatures[0]);
        signature.verify(&public_key, message).unwrap();
    }

    let status = setup.nodes[0].status_string(b"chain", 1).await.unwrap();
    assert!(status.contains("DSS"), "{status}");
}

#[tokio::test]
async fn instance_is_started_once() {
    let mut rng = rand_dev::DevRng::new();
    let setup = setup(4, 3, NetworkOptions::default(), config(), &mut rng);
    let (proposals_tx, _proposals_rx) = mpsc::unbounded_channel();

    let _sig = start(&setup, 0, b"chain", 1, &proposals_tx);
    let err = setup.nodes[0]
        .start(b"chain", 1, setup.shares[0].clone(), |_| (), |_| ())
        .unwrap_err();
    assert!(err.is_duplicate());

    // Same index of another series is a different instance
    let _sig = start(&setup, 0, b"other chain", 1, &proposals_tx);
    assert_eq!(setup.nodes[0].active_instances(), 2);
}

#[tokio::test]
async fn decision_for_unknown_instance_is_rejected() {
    let mut rng = rand_dev::DevRng::new();
    let setup = setup(4, 3, NetworkOptions::default(), config(), &mut rng);

    let err = setup.nodes[0]
        .decided_index_proposals(b"chain", 3, vec![vec![0, 1, 2]; 3], b"msg".to_vec())
        .unwrap_err();
    assert!(err.is_unknown_instance());
    assert!(setup.nodes[0]
        .status_string(b"chain", 3)
        .await
        .unwrap_err()
        .is_unknown_instance());
}

#[tokio::test]
async fn old_instances_are_closed() {
    let mut rng = rand_dev::DevRng::new();
    let setup = setup(4, 3, NetworkOptions::default(), config(), &mut rng);
    let (proposals_tx, _proposals_rx) = mpsc::unbounded_channel();
    let node = &setup.nodes[0];

    let _first = start(&setup, 0, b"chain", 1, &proposals_tx);
    let _second = start(&setup, 0, b"chain", 2, &proposals_tx);
    assert_eq!(node.active_instances(), 2);

    // Past window is 1: starting instance 3 closes instance 1
    let _third = start(&setup, 0, b"chain", 3, &proposals_tx);
    assert_eq!(node.active_instances(), 2);
    let err = node
        .start(b"chain", 1, setup.shares[0].clone(), |_| (), |_| ())
        .unwrap_err();
    assert!(err.is_out_of_window());
}

#[tokio::test]
async fn closed_node_rejects_everything() {
    let mut rng = rand_dev::DevRng::new();
    let setup = setup(4, 3, NetworkOptions::default(), config(), &mut rng);
    let (proposals_tx, _proposals_rx) = mpsc::unbounded_channel();
    let node = &setup.nodes[0];

    let signature = start(&setup, 0, b"chain", 1, &proposals_tx);
    node.close();
    assert_eq!(node.active_instances(), 0);
    assert!(node
        .start(b"chain", 2, setup.shares[0].clone(), |_| (), |_| ())
        .is_err());
    // Callback is dropped without being called
    assert!(signature.await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_start_keeps_buffered_messages() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    // Ticks never come after the first one: messages sent before the last node starts are
    // never resent, so it only signs if it replays them
    let config = config().with_tick_period(Duration::from_secs(60 * 60));
    let setup = setup(4, 3, NetworkOptions::default(), config, &mut rng);
    let (proposals_tx, mut proposals_rx) = mpsc::unbounded_channel();

    let mut signatures = (0..3)
        .map(|i| start(&setup, i, b"chain", 1, &proposals_tx))
        .collect::<Vec<_>>();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let foreign_share = key_shares::<E>(&mut rng, 5, 3).unwrap().remove(3);
    assert!(setup.nodes[3]
        .start(b"chain", 1, foreign_share, |_| (), |_| ())
        .is_err());
    assert_eq!(setup.nodes[3].active_instances(), 0);
    signatures.push(start(&setup, 3, b"chain", 1, &proposals_tx));

    let message = b"block #43";
    tokio::time::timeout(
        Duration::from_secs(60),
        decide(&setup, b"chain", 1, &mut proposals_rx, message),
    )
    .await
    .unwrap();
    let signatures = tokio::time::timeout(
        Duration::from_secs(60),
        futures::future::try_join_all(signatures),
    )
    .await
    .unwrap()
    .unwrap();
    let public_key = setup.shares[0].shared_public_key();
    for signature in &signatures {
        signature.verify(&public_key, message).unwrap();
    }
}
