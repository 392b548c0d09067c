use abft::{
    acss::{Acss, AcssInput, AcssMessage, Deal},
    ciphersuite::Secp256k1,
    codec::Wire,
    generic_ec::{curves::Secp256k1 as E, Point, Scalar, SecretScalar},
    gpa::Automaton,
    key::default_eval_points,
    poly,
    rbc::RbcMessage,
};
use abft_tests::{chacha, committee, init_tracing, Simulation};
use bytes::Bytes;
use test_case::test_case;

type C = Secp256k1;

fn simulation(
    n: usize,
    dealer: usize,
    rng: &mut rand_dev::DevRng,
) -> Simulation<Acss<C>, rand_dev::DevRng> {
    let (identities, committee) = committee::<C>(rng, n);
    let dealer = identities[dealer].node_id();
    let nodes = identities
        .into_iter()
        .map(|identity| {
            let me = identity.node_id();
            let acss = Acss::new(committee.clone(), identity, dealer, chacha(rng)).unwrap();
            (me, acss)
        })
        .collect();
    Simulation::new(nodes, rng.fork())
}

/// Checks that outputs are consistent shares of `secret`
fn assert_shares_of(sim: &Simulation<Acss<C>, rand_dev::DevRng>, secret: &Scalar<E>) {
    let n = sim.len();
    let eval_points = default_eval_points::<E>(n as u16);
    let outputs = sim
        .outputs()
        .into_iter()
        .map(|o| o.unwrap_or_else(|| panic!("no output: {}", sim.status())))
        .collect::<Vec<_>>();

    let commitment = &outputs[0].commitment;
    assert_eq!(commitment.constant_term(), Point::generator() * secret);
    for (j, output) in outputs.iter().enumerate() {
        assert_eq!(&output.commitment, commitment);
        assert!(commitment.verify_share(eval_points[j].as_ref(), output.share.as_ref()));
    }

    let t = commitment.len();
    let shares = outputs
        .iter()
        .zip(&eval_points)
        .rev()
        .take(t)
        .map(|(o, x)| (*x, *o.share.as_ref()))
        .collect::<Vec<_>>();
    assert_eq!(poly::interpolate(&shares, &Scalar::zero()), Some(*secret));
}

#[test_case(1, 0; "n1")]
#[test_case(4, 0; "n4")]
#[test_case(7, 3; "n7")]
fn secret_is_shared(n: usize, dealer: usize) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let mut sim = simulation(n, dealer, &mut rng);

    let secret = SecretScalar::random(&mut rng);
    let expected = *secret.as_ref();
    sim.input(dealer, AcssInput::Deal(secret)).unwrap();
    sim.run_to_completion(1_000_000).unwrap();

    assert_shares_of(&sim, &expected);
}

/// Deals the secret at node `dealer` outside the simulation, letting `tamper` modify the deal
fn tampered_deal(
    sim: &mut Simulation<Acss<C>, rand_dev::DevRng>,
    dealer: usize,
    secret: SecretScalar<E>,
    tamper: impl Fn(&mut Deal<C>),
) {
    let msgs = sim.node_mut(dealer).input(AcssInput::Deal(secret)).unwrap();
    let msgs = msgs.map(|msg| match msg {
        AcssMessage::Rbc(RbcMessage::Propose(bytes)) => {
            let mut deal = Deal::<C>::from_bytes(bytes).unwrap();
            tamper(&mut deal);
            AcssMessage::Rbc(RbcMessage::Propose(deal.to_bytes()))
        }
        msg => msg,
    });
    let from = sim.node_id(dealer);
    sim.inject(from, msgs);
}

#[test_case(4, 3; "n4")]
#[test_case(7, 5; "n7")]
fn member_with_corrupted_share_recovers_it(n: usize, victim: usize) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let mut sim = simulation(n, 0, &mut rng);

    let secret = SecretScalar::random(&mut rng);
    let expected = *secret.as_ref();
    tampered_deal(&mut sim, 0, secret, |deal| {
        deal.encrypted[victim] = deal.encrypted[victim] + Scalar::one();
    });
    sim.run_to_completion(1_000_000).unwrap();

    assert_shares_of(&sim, &expected);
}

#[test]
fn malformed_deal_is_never_delivered() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let mut sim = simulation(4, 0, &mut rng);

    tampered_deal(&mut sim, 0, SecretScalar::random(&mut rng), |deal| {
        deal.encrypted.pop();
    });
    sim.run_to_completion(1_000_000).unwrap();

    assert!(sim.outputs().iter().all(Option::is_none), "{}", sim.status());
}

#[test]
fn only_dealer_deals_once() {
    let mut rng = rand_dev::DevRng::new();
    let mut sim = simulation(4, 1, &mut rng);

    assert!(sim
        .input(0, AcssInput::Deal(SecretScalar::random(&mut rng)))
        .is_err());
    sim.input(1, AcssInput::Deal(SecretScalar::random(&mut rng)))
        .unwrap();
    let err = sim
        .input(1, AcssInput::Deal(SecretScalar::random(&mut rng)))
        .unwrap_err();
    assert!(err
        .chain()
        .any(|e| e.downcast_ref::<abft::gpa::ProtocolError>().is_some_and(|e| e.is_duplicate())));
}

#[test]
fn deal_survives_encoding() {
    let mut rng = rand_dev::DevRng::new();
    let mut sim = simulation(4, 0, &mut rng);
    let msgs = sim
        .node_mut(0)
        .input(AcssInput::Deal(SecretScalar::random(&mut rng)))
        .unwrap();
    let Some(AcssMessage::Rbc(RbcMessage::Propose(bytes))) = msgs.into_iter().next().map(|o| o.msg)
    else {
        panic!("dealer must propose the deal")
    };

    let deal = Deal::<C>::from_bytes(bytes.clone()).unwrap();
    assert_eq!(deal.to_bytes(), bytes);
    assert_eq!(deal.encrypted.len(), 4);
    assert_eq!(deal.commitment.len(), 2);

    let mut truncated = bytes.to_vec();
    truncated.pop();
    assert!(Deal::<C>::from_bytes(Bytes::from(truncated)).is_err());
}
