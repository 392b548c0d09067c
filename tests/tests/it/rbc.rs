use std::sync::Arc;

use bytes::Bytes;

use abft::{
    gpa::Automaton,
    rbc::{self, Rbc, RbcInput},
};
use abft_tests::{init_tracing, node_ids, Simulation};
use test_case::test_case;

fn simulation(
    n: usize,
    proposer: usize,
    predicate: impl Fn(usize) -> rbc::Predicate,
    rng: &mut rand_dev::DevRng,
) -> Simulation<Rbc, rand_dev::DevRng> {
    let peers = node_ids(n);
    let nodes = peers
        .iter()
        .enumerate()
        .map(|(i, me)| {
            let rbc = Rbc::new(peers.clone(), *me, peers[proposer], 1024, predicate(i));
            (*me, rbc)
        })
        .collect();
    Simulation::new(nodes, rng.fork())
}

#[test_case(1; "n1")]
#[test_case(4; "n4")]
#[test_case(7; "n7")]
fn everyone_delivers_proposal(n: usize) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();

    let mut sim = simulation(n, 0, |_| rbc::accept_all(), &mut rng);
    sim.input(0, RbcInput::Broadcast(b"hello".to_vec())).unwrap();
    sim.run_to_completion(100_000).unwrap();

    for (i, output) in sim.outputs().into_iter().enumerate() {
        assert_eq!(output.map(Vec::as_slice), Some(&b"hello"[..]), "node {i}");
    }
}

#[test]
fn delivery_waits_for_predicate() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();

    let mut sim = simulation(
        4,
        1,
        |i| {
            let predicate: rbc::Predicate = if i == 3 {
                Arc::new(|_: &[u8]| false)
            } else {
                rbc::accept_all()
            };
            predicate
        },
        &mut rng,
    );
    sim.input(1, RbcInput::Broadcast(b"hello".to_vec())).unwrap();
    sim.run_to_completion(100_000).unwrap();

    for i in 0..3 {
        assert_eq!(sim.node(i).output().map(Vec::as_slice), Some(&b"hello"[..]));
    }
    assert!(sim.node(3).output().is_none());

    sim.input(3, RbcInput::Predicate(rbc::accept_all())).unwrap();
    sim.run_to_completion(100_000).unwrap();
    assert_eq!(sim.node(3).output().map(Vec::as_slice), Some(&b"hello"[..]));
}

#[test]
fn only_proposer_broadcasts_once() {
    let peers = node_ids(4);
    let mut proposer = Rbc::new(peers.clone(), peers[0], peers[0], 8, rbc::accept_all());
    let mut other = Rbc::new(peers.clone(), peers[1], peers[0], 8, rbc::accept_all());

    assert!(other.input(RbcInput::Broadcast(b"hi".to_vec())).is_err());
    assert!(proposer.input(RbcInput::Broadcast(vec![])).is_err());
    assert!(proposer.input(RbcInput::Broadcast(vec![0; 9])).is_err());

    let out = proposer.input(RbcInput::Broadcast(b"hi".to_vec())).unwrap();
    assert_eq!(out.len(), 4);
    let err = proposer
        .input(RbcInput::Broadcast(b"hi".to_vec()))
        .unwrap_err();
    assert!(err.is_duplicate());
}

#[test]
fn proposal_from_non_proposer_is_ignored() {
    let peers = node_ids(4);
    let mut rbc = Rbc::new(peers.clone(), peers[1], peers[0], 8, rbc::accept_all());
    let out = rbc.message(peers[2], rbc::RbcMessage::Propose(Bytes::from_static(b"fake")));
    assert!(out.is_empty());
}
