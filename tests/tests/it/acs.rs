use std::collections::VecDeque;
use std::time::{Duration, Instant};

use abft::{
    acs::{batch::MsgBatch, session::CommonSubset, Acs},
    ciphersuite::Secp256k1,
    generic_ec::curves::Secp256k1 as E,
    key::max_faulty,
};
use abft_tests::{init_tracing, key_shares, node_ids, Simulation};
use rand::Rng;
use test_case::test_case;

const RESEND_PERIOD: Duration = Duration::from_millis(100);

#[test_case(4, 2; "t2n4")]
#[test_case(4, 3; "t3n4")]
#[test_case(7, 3; "t3n7")]
fn members_decide_same_subset(n: u16, t: u16) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let shares = key_shares::<E>(&mut rng, n, t).unwrap();
    let peers = node_ids(n.into());
    let nodes = peers
        .iter()
        .zip(shares)
        .map(|(me, dk)| {
            let acs = Acs::<Secp256k1>::new(peers.clone(), *me, dk, b"salt", 1024).unwrap();
            (*me, acs)
        })
        .collect();
    let mut sim = Simulation::new(nodes, rng.fork());

    sim.input_all(|i| peers[i].as_bytes().to_vec()).unwrap();
    sim.run_to_completion(10_000_000).unwrap();

    let outputs = sim.outputs();
    let decided = outputs[0].unwrap().clone();
    assert!(
        outputs.iter().all(|o| *o == Some(&decided)),
        "{}",
        sim.status()
    );
    let n = usize::from(n);
    assert!(decided.len() >= n - max_faulty(n));
    for (j, value) in &decided {
        assert_eq!(value.as_slice(), peers[usize::from(*j)].as_bytes());
    }
}

#[test]
fn duplicate_proposal_is_rejected() {
    let mut rng = rand_dev::DevRng::new();
    let shares = key_shares::<E>(&mut rng, 4, 2).unwrap();
    let peers = node_ids(4);
    let mut acs =
        Acs::<Secp256k1>::new(peers.clone(), peers[0], shares[0].clone(), b"salt", 1024).unwrap();
    abft::gpa::Automaton::input(&mut acs, b"one".to_vec()).unwrap();
    assert!(abft::gpa::Automaton::input(&mut acs, b"two".to_vec()).is_err());
}

/// Routes batches between sessions, dropping and duplicating some of them
struct SessionNetwork {
    sessions: Vec<CommonSubset<Secp256k1>>,
    queue: VecDeque<MsgBatch<Secp256k1>>,
    drop_rate: f64,
    duplicate_rate: f64,
}

impl SessionNetwork {
    fn deliver_all(&mut self, rng: &mut impl Rng, now: Instant) {
        while !self.queue.is_empty() {
            let pick = rng.gen_range(0..self.queue.len());
            let Some(batch) = self.queue.swap_remove_back(pick) else {
                break;
            };
            if rng.gen_bool(self.drop_rate) {
                continue;
            }
            if rng.gen_bool(self.duplicate_rate) {
                self.queue.push_back(batch.clone());
            }
            let to = usize::from(batch.dst);
            let out = self.sessions[to].receive(batch, now);
            self.queue.extend(out);
        }
    }

    fn tick(&mut self, now: Instant) {
        for session in &mut self.sessions {
            let out = session.tick(now);
            self.queue.extend(out);
        }
    }

    fn status(&self) -> String {
        self.sessions
            .iter()
            .map(|s| format!("\n  {}", s.status()))
            .collect()
    }
}

#[test_case(0.0, 0.0; "reliable")]
#[test_case(0.2, 0.0; "lossy")]
#[test_case(0.2, 0.2; "lossy and duplicating")]
fn session_survives_unreliable_network(drop_rate: f64, duplicate_rate: f64) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let n = 4;
    let shares = key_shares::<E>(&mut rng, n, 2).unwrap();
    let peers = node_ids(n.into());
    let mut net = SessionNetwork {
        sessions: shares
            .into_iter()
            .map(|dk| CommonSubset::new(7, 3, peers.clone(), dk, RESEND_PERIOD, 1024).unwrap())
            .collect(),
        queue: VecDeque::new(),
        drop_rate,
        duplicate_rate,
    };

    let mut now = Instant::now();
    for i in 0..usize::from(n) {
        let out = net.sessions[i]
            .input(format!("proposal of {i}").into_bytes(), now)
            .unwrap();
        net.queue.extend(out);
    }
    for _ in 0..500 {
        net.deliver_all(&mut rng, now);
        if net.sessions.iter().all(|s| s.is_terminated()) {
            break;
        }
        now += RESEND_PERIOD * 2;
        net.tick(now);
    }

    let decided = net.sessions[0].output().cloned().unwrap();
    for session in &net.sessions {
        assert!(session.is_terminated(), "{}", net.status());
        assert_eq!(session.output(), Some(&decided));
    }
    for (j, value) in &decided {
        assert_eq!(value, format!("proposal of {j}").as_bytes());
    }
}

#[test]
fn duplicate_batch_is_acknowledged_again() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let shares = key_shares::<E>(&mut rng, 4, 2).unwrap();
    let peers = node_ids(4);
    let mut sessions = shares
        .into_iter()
        .map(|dk| {
            CommonSubset::<Secp256k1>::new(1, 1, peers.clone(), dk, RESEND_PERIOD, 1024).unwrap()
        })
        .collect::<Vec<_>>();
    let now = Instant::now();

    let out = sessions[0].input(b"value".to_vec(), now).unwrap();
    let to_second = out.into_iter().find(|b| b.dst == 1).unwrap();
    assert_eq!(sessions[0].unacknowledged(), 3);

    let first = sessions[1].receive(to_second.clone(), now);
    assert!(first.iter().any(|b| b.dst == 0 && b.acks.contains(&to_second.id)));

    let again = sessions[1].receive(to_second.clone(), now);
    assert_eq!(again.len(), 1);
    assert!(again[0].acks.contains(&to_second.id));

    for batch in first.into_iter().filter(|b| b.dst == 0) {
        sessions[0].receive(batch, now);
    }
    assert_eq!(sessions[0].unacknowledged(), 2);
}
