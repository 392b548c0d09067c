use std::time::{Duration, Instant};

use abft::{
    ciphersuite::Secp256k1,
    coin::{service::CoinService, Coin, CoinInput, CommonCoin},
    config::CoinConfig,
    generic_ec::curves::Secp256k1 as E,
    gpa::Automaton,
};
use abft_tests::{init_tracing, key_shares, node_ids, pump, NetworkOptions, Simulation, TestNetwork};
use test_case::test_case;

const RESEND_PERIOD: Duration = Duration::from_millis(100);
const GIVE_UP_TIMEOUT: Duration = Duration::from_secs(10);

fn coins(
    n: u16,
    t: u16,
    sid: &[u8],
    rng: &mut rand_dev::DevRng,
) -> Vec<CommonCoin<Secp256k1>> {
    let shares = key_shares::<E>(rng, n, t).unwrap();
    let peers = node_ids(n.into());
    peers
        .iter()
        .zip(shares)
        .map(|(me, dk)| {
            CommonCoin::new(
                *me,
                peers.clone(),
                dk,
                sid.to_vec(),
                RESEND_PERIOD,
                GIVE_UP_TIMEOUT,
            )
            .unwrap()
        })
        .collect()
}

fn toss(coins: Vec<CommonCoin<Secp256k1>>, rng: &mut rand_dev::DevRng) -> Coin {
    let peers = node_ids(coins.len());
    let mut sim = Simulation::new(peers.into_iter().zip(coins).collect(), rng.fork());
    sim.input_all(|_| CoinInput::Start).unwrap();
    sim.run_to_completion(100_000).unwrap();

    let outputs = sim.outputs();
    let coin = *outputs[0].unwrap();
    assert!(outputs.iter().all(|c| *c == Some(&coin)), "{}", sim.status());
    coin
}

#[test_case(4, 2; "t2n4")]
#[test_case(7, 5; "t5n7")]
fn members_agree_on_coin(n: u16, t: u16) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    toss(coins(n, t, b"round 1", &mut rng), &mut rng);
}

#[test]
fn coin_is_determined_by_key_and_sid() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let shares = key_shares::<E>(&mut rng, 4, 3).unwrap();
    let peers = node_ids(4);
    let make = |sid: &[u8]| {
        peers
            .iter()
            .zip(&shares)
            .map(|(me, dk)| {
                CommonCoin::<Secp256k1>::new(
                    *me,
                    peers.clone(),
                    dk.clone(),
                    sid.to_vec(),
                    RESEND_PERIOD,
                    GIVE_UP_TIMEOUT,
                )
                .unwrap()
            })
            .collect::<Vec<_>>()
    };

    // Different delivery orders make different subsets of shares combined first
    let first = toss(make(b"sid"), &mut rng);
    let second = toss(make(b"sid"), &mut rng);
    let other = toss(make(b"other sid"), &mut rng);
    assert_eq!(first, second);
    assert_ne!(first, other);
    assert_eq!(first.to_string(), hex::encode(first.as_bytes()));
}

#[test]
fn coin_ignores_share_with_invalid_proof() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let mut coins = coins(4, 2, b"sid", &mut rng);
    let peers = node_ids(4);

    coins[0].input(CoinInput::Start).unwrap();
    let out = coins[1].input(CoinInput::Start).unwrap();
    let to_first = out
        .into_iter()
        .find(|o| o.to == peers[0])
        .unwrap()
        .msg;

    // Share of the second member claimed to come from the third one
    coins[0].message(peers[2], to_first.clone());
    assert!(coins[0].output().is_none());

    coins[0].message(peers[1], to_first);
    assert!(coins[0].output().is_some());
}

#[test]
fn own_share_is_resent_to_silent_members() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let mut coins = coins(4, 3, b"sid", &mut rng);
    let peers = node_ids(4);
    let t0 = Instant::now();

    let before_start = coins[0].input(CoinInput::Tick(t0)).unwrap();
    assert!(before_start.is_empty());
    coins[0].input(CoinInput::Start).unwrap();

    assert_eq!(coins[0].input(CoinInput::Tick(t0)).unwrap().len(), 3);
    assert!(coins[0]
        .input(CoinInput::Tick(t0 + RESEND_PERIOD / 2))
        .unwrap()
        .is_empty());

    let out = coins[1].input(CoinInput::Start).unwrap();
    for o in out.into_iter().filter(|o| o.to == peers[0]) {
        coins[0].message(peers[1], o.msg);
    }
    let resent = coins[0]
        .input(CoinInput::Tick(t0 + RESEND_PERIOD * 2))
        .unwrap();
    let mut recipients = resent.iter().map(|o| o.to).collect::<Vec<_>>();
    recipients.sort();
    let mut expected = vec![peers[2], peers[3]];
    expected.sort();
    assert_eq!(recipients, expected);
}

#[test]
fn coin_is_given_up_after_timeout() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let mut coins = coins(4, 3, b"sid", &mut rng);
    let t0 = Instant::now();

    coins[0].input(CoinInput::Start).unwrap();
    coins[0].input(CoinInput::Tick(t0)).unwrap();
    assert!(!coins[0].is_given_up());

    let out = coins[0]
        .input(CoinInput::Tick(t0 + GIVE_UP_TIMEOUT + RESEND_PERIOD))
        .unwrap();
    assert!(out.is_empty());
    assert!(coins[0].is_given_up());
    assert!(coins[0].output().is_none());
}

#[test]
fn start_twice_is_rejected() {
    let mut rng = rand_dev::DevRng::new();
    let mut coins = coins(4, 3, b"sid", &mut rng);
    coins[0].input(CoinInput::Start).unwrap();
    assert!(coins[0].input(CoinInput::Start).unwrap_err().is_duplicate());
}

#[test_case(0.0; "reliable")]
#[test_case(0.3; "lossy")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_produces_same_coin_everywhere(drop_rate: f64) {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let n = 4;
    let shares = key_shares::<E>(&mut rng, n, 3).unwrap();
    let members = node_ids(n.into());

    let options = NetworkOptions {
        drop_rate,
        max_delay: Some(Duration::from_millis(5)),
    };
    let (network, inboxes) = TestNetwork::new(n.into(), options, 42);
    let config = CoinConfig::default()
        .with_resend_period(Duration::from_millis(20))
        .with_give_up_timeout(Duration::from_secs(30));

    let services = shares
        .into_iter()
        .zip(inboxes)
        .enumerate()
        .map(|(i, (dk, inbox))| {
            let service = CoinService::<Secp256k1, _>::new(
                members.clone(),
                dk,
                network.endpoint(i as u16),
                config.clone(),
            )
            .unwrap();
            let receiver = service.clone();
            pump(inbox, move |from, payload| receiver.receive(from, payload));
            service
        })
        .collect::<Vec<_>>();

    let coins = futures::future::try_join_all(
        services.iter().map(|service| service.get_coin(b"epoch 7")),
    )
    .await
    .unwrap();
    assert!(coins.iter().all(|c| *c == coins[0]));

    // Repeated request is served by the same coin
    let again = services[2].get_coin(b"epoch 7").await.unwrap();
    assert_eq!(again, coins[0]);

    for service in &services {
        service.close();
        assert_eq!(service.active_coins(), 0);
    }
    assert!(services[0].get_coin(b"epoch 8").await.is_err());
}

#[test]
fn repeated_share_is_answered_once_per_period() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let mut coins = coins(4, 3, b"sid", &mut rng);
    let peers = node_ids(4);
    let t0 = Instant::now();

    coins[0].input(CoinInput::Start).unwrap();
    let from_second = coins[1]
        .input(CoinInput::Start)
        .unwrap()
        .into_iter()
        .find(|o| o.to == peers[0])
        .unwrap()
        .msg;

    assert!(coins[0].message(peers[1], from_second.clone()).is_empty());
    // Second member resends its share: it hasn't got ours
    let answer = coins[0].message(peers[1], from_second.clone());
    assert_eq!(answer.len(), 1);
    assert!(coins[0].message(peers[1], from_second.clone()).is_empty());

    coins[0].input(CoinInput::Tick(t0)).unwrap();
    assert_eq!(coins[0].message(peers[1], from_second).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn produced_coins_are_discarded_after_linger_period() {
    init_tracing();
    let mut rng = rand_dev::DevRng::new();
    let n = 4;
    let shares = key_shares::<E>(&mut rng, n, 3).unwrap();
    let members = node_ids(n.into());
    let (network, inboxes) = TestNetwork::new(n.into(), NetworkOptions::default(), 7);
    let config = CoinConfig::default()
        .with_resend_period(Duration::from_millis(20))
        .with_give_up_timeout(Duration::from_secs(30))
        .with_linger_period(Duration::from_millis(100));

    let services = shares
        .into_iter()
        .zip(inboxes)
        .enumerate()
        .map(|(i, (dk, inbox))| {
            let service = CoinService::<Secp256k1, _>::new(
                members.clone(),
                dk,
                network.endpoint(i as u16),
                config.clone(),
            )
            .unwrap();
            let receiver = service.clone();
            pump(inbox, move |from, payload| receiver.receive(from, payload));
            service
        })
        .collect::<Vec<_>>();

    let sids = (0..20u32).map(|round| round.to_be_bytes()).collect::<Vec<_>>();
    for sid in &sids {
        futures::future::try_join_all(services.iter().map(|service| service.get_coin(sid)))
            .await
            .unwrap();
    }

    // Service is never closed: coins go away on their own
    tokio::time::timeout(Duration::from_secs(10), async {
        while services.iter().any(|service| service.active_coins() > 0) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}
