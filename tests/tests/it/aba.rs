use abft::{aba::Aba, ciphersuite::Secp256k1, generic_ec::curves::Secp256k1 as E, gpa::Automaton};
use abft_tests::{init_tracing, key_shares, node_ids, Simulation};
use rand::Rng;
use test_case::test_case;

fn simulation(
    n: u16,
    rng: &mut rand_dev::DevRng,
) -> Simulation<Aba<Secp256k1>, rand_dev::DevRng> {
    let t = abft::key::max_faulty(n.into()) as u16 + 1;
    let shares = key_shares::<E>(rng, n, t.max(2)).unwrap();
    let peers = node_ids(n.into());
    let nodes = peers
        .iter()
        .zip(shares)
        .map(|(me, dk)| {
            let aba = Aba::new(peers.clone(), *me, dk, b"aba".to_vec()).unwrap();
            (*me, aba)
        })
        .collect();
    Simulation::new(nodes, rng.fork())
}

#[test_case(4, true; "n4 all true")]
#[test_case(4, false; "n4 all false")]
#[test_case(7, true; "n7 all true")]
#[test_case(7, false; "n7 all false")]
fn unanimous_input_is_decided(n: u16, value: bool) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let mut sim = simulation(n, &mut rng);

    sim.input_all(|_| value).unwrap();
    sim.run_to_completion(1_000_000).unwrap();

    for (i, output) in sim.outputs().into_iter().enumerate() {
        assert_eq!(output, Some(&value), "node {i}: {}", sim.status());
    }
}

#[test_case(4; "n4")]
#[test_case(7; "n7")]
#[test_case(10; "n10")]
fn mixed_input_is_agreed(n: u16) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let inputs = (0..n).map(|_| rng.gen::<bool>()).collect::<Vec<_>>();
    let mut sim = simulation(n, &mut rng);

    sim.input_all(|i| inputs[i]).unwrap();
    sim.run_to_completion(1_000_000).unwrap();

    let outputs = sim.outputs();
    let decision = *outputs[0].unwrap();
    assert!(
        outputs.iter().all(|o| *o == Some(&decision)),
        "{}",
        sim.status()
    );
    // Decided value was proposed by someone
    assert!(inputs.contains(&decision));
    for i in 0..sim.len() {
        assert!(sim.node(i).is_terminated(), "node {i}: {}", sim.status());
    }
}

#[test]
fn late_member_catches_up() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let mut sim = simulation(4, &mut rng);

    for i in 0..3 {
        sim.input(i, true).unwrap();
    }
    sim.run_to_completion(1_000_000).unwrap();
    sim.input(3, false).unwrap();
    sim.run_to_completion(1_000_000).unwrap();

    for output in sim.outputs() {
        assert_eq!(output, Some(&true));
    }
}

#[test]
fn second_input_is_rejected() {
    let mut rng = rand_dev::DevRng::new();
    let mut sim = simulation(4, &mut rng);
    sim.input(0, true).unwrap();
    assert!(sim.input(0, false).is_err());
}
