use abft::{
    adkg::{agreement::decide_indexes, nonce::NonceDkg, Adkg, DkgInput, DkgKey, DkgOutput},
    ciphersuite::Secp256k1,
    generic_ec::{curves::Secp256k1 as E, Point, Scalar},
    gpa::Automaton,
    key::{default_eval_points, max_faulty},
    poly,
};
use abft_tests::{chacha, committee, init_tracing, Simulation};
use test_case::test_case;

type C = Secp256k1;

/// Runs the DKG until every node knows its proposal, agrees on proposals of the first $n-f$
/// nodes, and runs until every node generates the key
fn run_dkg<A>(mut sim: Simulation<A, rand_dev::DevRng>) -> Vec<DkgKey<C>>
where
    A: Automaton<Input = DkgInput, Output = DkgOutput<C>>,
    A::Message: Clone,
{
    let n = sim.len();
    let f = max_faulty(n);
    sim.input_all(|_| DkgInput::Start).unwrap();
    sim.run_until(10_000_000, |sim| {
        sim.outputs()
            .iter()
            .all(|o| o.is_some_and(|o| o.indexes.is_some()))
    })
    .unwrap();

    let proposals = sim
        .outputs()
        .into_iter()
        .take(n - f)
        .map(|o| o.and_then(|o| o.indexes.clone()).unwrap())
        .collect::<Vec<_>>();
    sim.input_all(|_| DkgInput::AgreementResult(proposals.clone()))
        .unwrap();
    sim.run_to_completion(10_000_000).unwrap();

    sim.outputs()
        .into_iter()
        .map(|o| {
            o.and_then(|o| o.key.clone())
                .unwrap_or_else(|| panic!("key is not generated: {}", sim.status()))
        })
        .collect()
}

fn assert_consistent(keys: &[DkgKey<C>], expected_threshold: usize) {
    let n = keys.len();
    let eval_points = default_eval_points::<E>(n as u16);
    let public_key = keys[0].public_key();
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(usize::from(key.index), i);
        assert_eq!(key.indexes, keys[0].indexes);
        assert_eq!(key.commitment, keys[0].commitment);
        assert!(key
            .commitment
            .verify_share(eval_points[i].as_ref(), key.share.as_ref()));
    }
    assert_eq!(usize::from(keys[0].threshold()), expected_threshold);

    let shares = keys
        .iter()
        .zip(&eval_points)
        .skip(n - expected_threshold)
        .map(|(key, x)| (*x, *key.share.as_ref()))
        .collect::<Vec<_>>();
    let secret = poly::interpolate(&shares, &Scalar::zero()).unwrap();
    assert_eq!(Point::generator() * secret, public_key);
}

#[test_case(4; "n4")]
#[test_case(7; "n7")]
fn adkg_generates_shared_key(n: usize) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let (identities, committee) = committee::<C>(&mut rng, n);
    let nodes = identities
        .into_iter()
        .map(|identity| {
            let me = identity.node_id();
            (me, Adkg::new(committee.clone(), identity, chacha(&mut rng)).unwrap())
        })
        .collect();
    let keys = run_dkg(Simulation::new(nodes, rng.fork()));

    let f = max_faulty(n);
    assert!(keys[0].indexes.len() > f);
    assert_consistent(&keys, f + 1);

    // Generated key is usable as a long-term key
    for key in &keys {
        let dk = key.to_dk_share(n as u16).unwrap();
        assert_eq!(dk.shared_public_key(), key.public_key());
        assert_eq!(usize::from(dk.threshold()), f + 1);
    }
}

#[test_case(4; "n4")]
#[test_case(7; "n7")]
fn nonce_dkg_generates_shared_nonce(n: usize) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let (identities, committee) = committee::<C>(&mut rng, n);
    let nodes = identities
        .into_iter()
        .map(|identity| {
            let me = identity.node_id();
            (me, NonceDkg::new(committee.clone(), identity, chacha(&mut rng)).unwrap())
        })
        .collect();
    let keys = run_dkg(Simulation::new(nodes, rng.fork()));

    let f = max_faulty(n);
    assert!(keys[0].indexes.len() > f);
    assert_consistent(&keys, f + 1);
}

#[test]
fn nonce_proposal_lists_first_completed_sharings() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let n = 4;
    let (identities, committee) = committee::<C>(&mut rng, n);
    let nodes = identities
        .into_iter()
        .map(|identity| {
            let me = identity.node_id();
            (me, NonceDkg::new(committee.clone(), identity, chacha(&mut rng)).unwrap())
        })
        .collect();
    let mut sim = Simulation::new(nodes, rng.fork());

    sim.input_all(|_| DkgInput::Start).unwrap();
    sim.run_until(10_000_000, |sim| {
        sim.outputs().iter().all(|o| o.is_some())
    })
    .unwrap();
    for output in sim.outputs() {
        let indexes = output.and_then(|o| o.indexes.as_ref()).unwrap();
        assert!(indexes.len() >= n - max_faulty(n));
        assert!(indexes.windows(2).all(|w| w[0] < w[1]));
    }
    assert!(sim.input(0, DkgInput::Start).is_err());
}

#[test]
fn agreement_counts_votes() {
    // n = 4, f = 1: index is agreed if proposed by at least two members
    let proposals = vec![vec![0, 1, 2], vec![1, 2, 3], vec![2, 3, 0]];
    assert_eq!(decide_indexes(&proposals, 4, 1).unwrap(), vec![0, 1, 2, 3]);

    let proposals = vec![vec![0, 1], vec![1, 2], vec![2, 3]];
    assert_eq!(decide_indexes(&proposals, 4, 1).unwrap(), vec![1, 2]);
}

#[test]
fn agreement_skips_short_proposals_and_duplicates() {
    let proposals = vec![vec![0, 2, 2], vec![0, 1], vec![0, 1, 9], vec![3]];
    // Repeated `2` gives no vote, `9` is out of range, `[3]` is too short
    assert_eq!(decide_indexes(&proposals, 4, 1).unwrap(), vec![0, 1]);

    // Proposal repeating an index still votes for its other indexes
    let proposals = vec![vec![0, 2, 2, 3], vec![0, 2, 3], vec![1, 3]];
    assert_eq!(decide_indexes(&proposals, 4, 1).unwrap(), vec![0, 3]);
}

#[test_case(vec![vec![0, 1], vec![0, 1]]; "too few proposals")]
#[test_case(vec![vec![0, 1], vec![0, 2], vec![0, 3]]; "too few agreed")]
#[test_case(vec![vec![0], vec![0], vec![0]]; "all too short")]
fn agreement_rejects_inconsistent_result(proposals: Vec<Vec<u16>>) {
    let err = decide_indexes(&proposals, 4, 1).unwrap_err();
    assert!(err.is_inconsistency());
}

#[test]
fn agreement_result_is_accepted_once() {
    let mut rng = rand_dev::DevRng::new();
    let (identities, committee) = committee::<C>(&mut rng, 4);
    let identity = identities.into_iter().next().unwrap();
    let mut adkg = Adkg::new(committee, identity, chacha(&mut rng)).unwrap();

    let proposals = vec![vec![0, 1], vec![0, 1], vec![0, 1]];
    adkg.input(DkgInput::AgreementResult(proposals.clone()))
        .unwrap();
    let err = adkg
        .input(DkgInput::AgreementResult(proposals))
        .unwrap_err();
    assert!(err.is_duplicate());
}
