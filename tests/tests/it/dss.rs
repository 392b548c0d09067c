use std::sync::Arc;

use abft::{
    adkg::{Adkg, DkgInput},
    ciphersuite::Secp256k1,
    dss::{Dss, DssInput, DssMessage},
    generic_ec::{curves::Secp256k1 as E, Scalar},
    gpa::{Automaton, Outgoing},
    key::{max_faulty, Committee, NodeIdentity},
    signature::Signature,
    DkShare,
};
use abft_tests::{chacha, committee, init_tracing, key_shares, Simulation};
use test_case::test_case;

type C = Secp256k1;

type Sim = Simulation<Dss<C>, rand_dev::DevRng>;

fn sign(
    identities: Vec<NodeIdentity<C>>,
    committee: &Committee<C>,
    shares: &[Arc<DkShare<E>>],
    message: &[u8],
    rng: &mut rand_dev::DevRng,
) -> Vec<Signature<C>> {
    sign_with(identities, committee, shares, message, rng, |_| ())
}

/// Same as [`sign`], `tamper` is called right before the signing starts
fn sign_with(
    identities: Vec<NodeIdentity<C>>,
    committee: &Committee<C>,
    shares: &[Arc<DkShare<E>>],
    message: &[u8],
    rng: &mut rand_dev::DevRng,
    tamper: impl FnOnce(&mut Sim),
) -> Vec<Signature<C>> {
    let n = identities.len();
    let f = max_faulty(n);
    let nodes = identities
        .into_iter()
        .zip(shares)
        .map(|(identity, dk)| {
            let me = identity.node_id();
            let dss = Dss::new(committee.clone(), identity, dk.clone(), chacha(rng)).unwrap();
            (me, dss)
        })
        .collect();
    let mut sim = Simulation::new(nodes, rng.fork());
    tamper(&mut sim);

    sim.input_all(|_| DssInput::Start).unwrap();
    sim.run_until(10_000_000, |sim| {
        sim.outputs()
            .iter()
            .all(|o| o.is_some_and(|o| o.proposed_indexes.is_some()))
    })
    .unwrap();

    // Stands for the agreement on proposals: first n-f members are decided
    let proposals = sim
        .outputs()
        .into_iter()
        .take(n - f)
        .map(|o| o.and_then(|o| o.proposed_indexes.clone()).unwrap())
        .collect::<Vec<_>>();
    sim.input_all(|_| DssInput::Decided {
        proposals: proposals.clone(),
        message: message.to_vec(),
    })
    .unwrap();
    sim.run_to_completion(10_000_000).unwrap();

    sim.outputs()
        .into_iter()
        .map(|o| {
            o.and_then(|o| o.signature)
                .unwrap_or_else(|| panic!("not signed: {}", sim.status()))
        })
        .collect()
}

#[test_case(4, 2, b"block #42"; "t2n4")]
#[test_case(4, 3, b"block #42"; "t3n4")]
#[test_case(10, 7, b"block #42"; "t7n10")]
#[test_case(10, 7, b"putin chuilo"; "t7n10 short message")]
fn committee_signs_message(n: u16, t: u16, message: &[u8]) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let (identities, committee) = committee::<C>(&mut rng, n.into());
    let shares = key_shares::<E>(&mut rng, n, t).unwrap();

    let signatures = sign(identities, &committee, &shares, message, &mut rng);

    let public_key = shares[0].shared_public_key();
    for signature in &signatures {
        assert_eq!(signature, &signatures[0]);
        signature.verify(&public_key, message).unwrap();
    }
    assert!(signatures[0].verify(&public_key, b"another message").is_err());
}

#[test]
fn key_generated_by_adkg_signs() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let n = 4;
    let f = max_faulty(n);
    let (identities, committee) = committee::<C>(&mut rng, n);

    let nodes = identities
        .iter()
        .map(|identity| {
            let adkg = Adkg::new(committee.clone(), identity.clone(), chacha(&mut rng)).unwrap();
            (identity.node_id(), adkg)
        })
        .collect();
    let mut sim = Simulation::new(nodes, rng.fork());
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

    let shares = sim
        .outputs()
        .into_iter()
        .map(|o| {
            let key = o.and_then(|o| o.key.as_ref()).unwrap();
            Arc::new(key.to_dk_share(n as u16).unwrap())
        })
        .collect::<Vec<_>>();

    let signatures = sign(identities, &committee, &shares, b"hello", &mut rng);
    let public_key = shares[0].shared_public_key();
    for signature in &signatures {
        signature.verify(&public_key, b"hello").unwrap();
    }
}

#[test]
fn key_share_must_match_committee() {
    let mut rng = rand_dev::DevRng::new();
    let (identities, committee) = committee::<C>(&mut rng, 4);
    let shares = key_shares::<E>(&mut rng, 4, 3).unwrap();

    // Share of another member
    let err = Dss::new(
        committee.clone(),
        identities[1].clone(),
        shares[0].clone(),
        chacha(&mut rng),
    );
    assert!(err.is_err());

    // Key shared among a different number of members
    let other_shares = key_shares::<E>(&mut rng, 5, 3).unwrap();
    let err = Dss::new(
        committee,
        identities[0].clone(),
        other_shares[0].clone(),
        chacha(&mut rng),
    );
    assert!(err.is_err());
}

#[test]
fn decision_is_accepted_once() {
    let mut rng = rand_dev::DevRng::new();
    let (identities, committee) = committee::<C>(&mut rng, 4);
    let shares = key_shares::<E>(&mut rng, 4, 3).unwrap();
    let mut dss = Dss::new(
        committee,
        identities[0].clone(),
        shares[0].clone(),
        chacha(&mut rng),
    )
    .unwrap();

    let decided = || DssInput::Decided {
        proposals: vec![vec![0, 1, 2]; 3],
        message: b"msg".to_vec(),
    };
    dss.input(decided()).unwrap();
    assert!(dss.input(decided()).unwrap_err().is_duplicate());
}

#[test]
fn invalid_partial_signature_is_dropped() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let (identities, committee) = committee::<C>(&mut rng, 4);
    let shares = key_shares::<E>(&mut rng, 4, 2).unwrap();
    let message = b"block #42";
    let garbage = Scalar::<E>::random(&mut rng);

    let signatures = sign_with(identities, &committee, &shares, message, &mut rng, |sim| {
        // Node 3 sends a garbage partial to everyone before anything else
        let from = sim.node_id(3);
        let forged = (0..3)
            .map(|i| Outgoing {
                to: sim.node_id(i),
                msg: DssMessage::Partial(garbage),
            })
            .collect::<Vec<_>>();
        sim.inject(from, forged);
    });

    let public_key = shares[0].shared_public_key();
    for signature in &signatures {
        assert_eq!(signature, &signatures[0]);
        signature.verify(&public_key, message).unwrap();
    }
}
