//! Multi-silo directory scenarios over the in-process transport.

mod common;

use std::rc::Rc;
use std::time::Duration;

use common::{activation, ctx, directory_config, grain, silo, TestCluster};
use tidepool::directory::{
    Deadline, DirectoryError, PartitionRing, RemoteGrainDirectory, RequestContext,
};
use tidepool::membership::{ClusterMember, MembershipOracle, SharedMembership, SiloStatus};
use tidepool::silo::Silo;
use tidepool::transport::{InProcessTransport, TransportError};
use tidepool::types::{ActivationId, GrainAddress, UnregistrationCause, VersionTag};
use tidepool::{TimeProvider, TokioTimeProvider};

#[tokio::test]
async fn test_register_is_forwarded_to_owner() {
    let cluster = TestCluster::new(&[1, 2, 3]);
    let a = silo(1);
    let grain = cluster.grain_not_owned_by(&a);
    let owner = cluster.owner_of(&grain);
    let address = activation(&grain, &a);

    let result = cluster
        .silo(&a)
        .directory()
        .register(address.clone(), cluster.ctx())
        .await
        .expect("register");
    assert_eq!(result.address.as_ref(), Some(&address));
    assert_eq!(result.version_tag, VersionTag(1));

    for s in &cluster.silos {
        let expected = usize::from(s.address() == &owner);
        assert_eq!(s.directory().partition_len(), expected, "{}", s.address());
    }

    // Any silo resolves the same entry.
    for s in &cluster.silos {
        let found = s
            .directory()
            .lookup(grain.clone(), cluster.ctx())
            .await
            .expect("lookup");
        assert_eq!(found, result);
    }
}

#[tokio::test]
async fn test_first_registration_wins_for_every_caller() {
    let cluster = TestCluster::new(&[1, 2, 3]);
    let (a, c) = (silo(1), silo(3));
    let grain = cluster.grain_not_owned_by(&a);
    let first = activation(&grain, &a);
    let second = activation(&grain, &c);

    let won = cluster
        .silo(&a)
        .directory()
        .register(first.clone(), cluster.ctx())
        .await
        .expect("first register");
    let lost = cluster
        .silo(&c)
        .directory()
        .register(second.clone(), cluster.ctx())
        .await
        .expect("second register");

    assert_eq!(won.address.as_ref(), Some(&first));
    assert_eq!(lost, won);
}

#[tokio::test]
async fn test_concurrent_registrations_agree_on_winner() {
    let cluster = TestCluster::new(&[1, 2, 3]);
    let (a, b) = (silo(1), silo(2));
    let grain = grain("contended");
    let from_a = activation(&grain, &a);
    let from_b = activation(&grain, &b);

    let (ra, rb) = tokio::join!(
        cluster
            .silo(&a)
            .directory()
            .register(from_a.clone(), cluster.ctx()),
        cluster
            .silo(&b)
            .directory()
            .register(from_b.clone(), cluster.ctx()),
    );
    let ra = ra.expect("register from a");
    let rb = rb.expect("register from b");

    assert_eq!(ra, rb);
    let winner = ra.address.expect("a winner");
    assert!(winner == from_a || winner == from_b);
}

#[tokio::test]
async fn test_reregistering_same_activation_is_idempotent() {
    let cluster = TestCluster::new(&[1, 2]);
    let a = silo(1);
    let grain = grain("idempotent");
    let address = activation(&grain, &a);
    let directory = cluster.silo(&a).directory();

    let first = directory
        .register(address.clone(), cluster.ctx())
        .await
        .expect("register");
    let again = directory
        .register(address.clone(), cluster.ctx())
        .await
        .expect("register again");

    assert_eq!(first, again);
    let total: usize = cluster
        .silos
        .iter()
        .map(|s| s.directory().partition_len())
        .sum();
    assert_eq!(total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_lazy_unregister_waits_for_grace_window() {
    let cluster = TestCluster::new(&[1, 2]);
    let a = silo(1);
    let grain = grain("lazy");
    let address = activation(&grain, &a);
    let directory = cluster.silo(&a).directory();

    directory
        .register(address.clone(), cluster.ctx())
        .await
        .expect("register");

    directory
        .unregister(
            address.clone(),
            UnregistrationCause::NonexistentActivation,
            cluster.ctx(),
        )
        .await
        .expect("early lazy unregister");
    let found = directory
        .lookup(grain.clone(), cluster.ctx())
        .await
        .expect("lookup");
    assert_eq!(found.address.as_ref(), Some(&address));

    tokio::time::advance(Duration::from_secs(61)).await;
    directory
        .unregister(
            address.clone(),
            UnregistrationCause::NonexistentActivation,
            cluster.ctx(),
        )
        .await
        .expect("late lazy unregister");
    let found = directory
        .lookup(grain.clone(), cluster.ctx())
        .await
        .expect("lookup");
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_force_unregister_removes_immediately() {
    let cluster = TestCluster::new(&[1, 2, 3]);
    let (a, b) = (silo(1), silo(2));
    let grain = cluster.grain_not_owned_by(&b);
    let address = activation(&grain, &a);

    cluster
        .silo(&a)
        .directory()
        .register(address.clone(), cluster.ctx())
        .await
        .expect("register");

    // Unregistering a different activation is ignored.
    let stranger = activation(&grain, &a);
    cluster
        .silo(&b)
        .directory()
        .unregister(stranger, UnregistrationCause::Force, cluster.ctx())
        .await
        .expect("unregister stranger");
    assert!(!cluster
        .silo(&b)
        .directory()
        .lookup(grain.clone(), cluster.ctx())
        .await
        .expect("lookup")
        .is_empty());

    cluster
        .silo(&b)
        .directory()
        .unregister(address, UnregistrationCause::Force, cluster.ctx())
        .await
        .expect("unregister");
    assert!(cluster
        .silo(&a)
        .directory()
        .lookup(grain, cluster.ctx())
        .await
        .expect("lookup")
        .is_empty());
}

#[tokio::test]
async fn test_unregister_many_spans_owners() {
    let cluster = TestCluster::new(&[1, 2, 3]);
    let a = silo(1);
    let directory = cluster.silo(&a).directory();

    let mut addresses = Vec::new();
    for i in 0..12 {
        let address = activation(&grain(&format!("batch-{i}")), &a);
        directory
            .register(address.clone(), cluster.ctx())
            .await
            .expect("register");
        addresses.push(address);
    }

    let outcomes = directory
        .unregister_many(addresses.clone(), UnregistrationCause::Force, cluster.ctx())
        .await;
    assert_eq!(outcomes.len(), addresses.len());
    assert!(outcomes.iter().all(|o| o.result.is_ok()));
    for s in &cluster.silos {
        assert_eq!(s.directory().partition_len(), 0);
    }
}

#[tokio::test]
async fn test_disagreeing_views_hit_hop_limit() {
    common::init_tracing();
    let time = TokioTimeProvider::new();
    let transport = Rc::new(InProcessTransport::new());
    let (a, b) = (silo(1), silo(2));

    // Each silo believes only the other one is active, so each forwards to
    // the other.
    let build = |me: &tidepool::SiloAddress, other: &tidepool::SiloAddress| {
        let view: Rc<dyn MembershipOracle> =
            Rc::new(SharedMembership::with_active_silos([other.clone()]));
        Silo::builder()
            .address(me.clone())
            .time(time.clone())
            .transport(transport.clone())
            .membership(view)
            .directory_config(directory_config())
            .build()
            .expect("build silo")
    };
    let silo_a = build(&a, &b);
    let _silo_b = build(&b, &a);

    let grain = grain("ping-pong");
    let result = silo_a
        .directory()
        .register(activation(&grain, &a), ctx(&time, Duration::from_secs(5)))
        .await;
    assert!(
        matches!(result, Err(DirectoryError::HopLimitExceeded { .. })),
        "{result:?}"
    );
}

#[tokio::test]
async fn test_expired_deadline_is_not_forwarded() {
    let cluster = TestCluster::new(&[1, 2, 3]);
    let a = silo(1);
    let grain = cluster.grain_not_owned_by(&a);
    let expired = RequestContext::new(Deadline::at(cluster.time.now()));

    let result = cluster
        .silo(&a)
        .directory()
        .register(activation(&grain, &a), expired)
        .await;
    assert_eq!(result, Err(DirectoryError::DeadlineExceeded));
    for s in &cluster.silos {
        assert_eq!(s.directory().partition_len(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_owner_fails_after_retries() {
    let cluster = TestCluster::new(&[1, 2]);
    let (a, b) = (silo(1), silo(2));
    let grain = cluster.grain_not_owned_by(&a);
    cluster.transport.set_unreachable(&b, true);

    let started = cluster.time.now();
    let result = cluster
        .silo(&a)
        .directory()
        .register(activation(&grain, &a), cluster.ctx())
        .await;
    assert_eq!(
        result,
        Err(DirectoryError::Transport(TransportError::Unreachable(
            b.clone()
        )))
    );
    // Two retries, one delay each.
    let elapsed = cluster.time.now() - started;
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_forward_recovers_when_owner_comes_back() {
    let cluster = TestCluster::new(&[1, 2]);
    let (a, b) = (silo(1), silo(2));
    let grain = cluster.grain_not_owned_by(&a);
    let address = activation(&grain, &a);
    cluster.transport.set_unreachable(&b, true);

    let (result, ()) = tokio::join!(
        cluster
            .silo(&a)
            .directory()
            .register(address.clone(), cluster.ctx()),
        async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cluster.transport.set_unreachable(&b, false);
        },
    );
    let result = result.expect("register after heal");
    assert_eq!(result.address, Some(address));
    assert_eq!(cluster.silo(&b).directory().partition_len(), 1);
}

#[tokio::test]
async fn test_entries_move_to_joining_silo() {
    let mut cluster = TestCluster::new(&[1, 2]);
    let a = silo(1);
    let grains: Vec<_> = (0..40).map(|i| grain(&format!("handoff-{i}"))).collect();
    let mut registered = Vec::new();
    for g in &grains {
        let result = cluster
            .silo(&a)
            .directory()
            .register(activation(g, &a), cluster.ctx())
            .await
            .expect("register");
        registered.push(result);
    }

    let c = silo(3);
    let joined = cluster.build_silo(c.clone(), 0, Default::default());
    cluster.silos.push(joined);
    cluster
        .membership
        .register_silo(ClusterMember::new(c.clone(), SiloStatus::Active, "silo-3"));

    let pending: usize = cluster
        .silos
        .iter()
        .map(|s| s.directory().pending_handoffs())
        .sum();
    assert!(pending > 0, "some entries should move to the new silo");

    for s in &cluster.silos {
        s.directory().flush_handoffs().await;
    }

    let total: usize = cluster
        .silos
        .iter()
        .map(|s| s.directory().partition_len())
        .sum();
    assert_eq!(total, grains.len());
    assert_eq!(cluster.silo(&c).directory().partition_len(), pending);

    for (g, before) in grains.iter().zip(&registered) {
        let found = cluster
            .silo(&c)
            .directory()
            .lookup(g.clone(), cluster.ctx())
            .await
            .expect("lookup");
        assert_eq!(found.address, before.address, "{g}");
    }
}

#[tokio::test]
async fn test_handoff_conflict_deactivates_the_losing_activation() {
    let mut cluster = TestCluster::new(&[1, 2]);
    let c = silo(3);
    let before = cluster.silos[0].directory().ring();
    let after = PartitionRing::from_snapshot(
        &SharedMembership::with_active_silos([silo(1), silo(2), c.clone()]).current(),
        directory_config().vnodes_per_silo(),
    );
    let contested = (0..)
        .map(|i| grain(&format!("contested-{i}")))
        .find(|g| after.owner(g) == Some(c.clone()))
        .expect("some grain moves to the joining silo");
    let old_owner = before.owner(&contested).expect("old owner");

    let x = GrainAddress::new(contested.clone(), old_owner.clone(), ActivationId(1));
    let told_x = cluster
        .silo(&silo(1))
        .directory()
        .register(x.clone(), cluster.ctx())
        .await
        .expect("register x");
    assert_eq!(told_x.address, Some(x.clone()));

    // The new owner learns about the grain before the old owner hands it off.
    let joined = cluster.build_silo(c.clone(), 1, Default::default());
    cluster.silos.push(joined);
    cluster
        .membership
        .register_silo(ClusterMember::new(c.clone(), SiloStatus::Active, "silo-3"));
    assert_eq!(cluster.silo(&old_owner).directory().pending_handoffs(), 1);

    let y = GrainAddress::new(contested.clone(), c.clone(), ActivationId(2));
    let told_y = cluster
        .silo(&c)
        .directory()
        .register(y.clone(), cluster.ctx())
        .await
        .expect("register y");
    assert_eq!(told_y.address, Some(y.clone()));

    for s in &cluster.silos {
        s.directory().flush_handoffs().await;
    }

    // Equal tags, so the lower activation id survives.
    let found = cluster
        .silo(&c)
        .directory()
        .lookup(contested.clone(), cluster.ctx())
        .await
        .expect("lookup");
    assert_eq!(found.address, Some(x));
    assert_eq!(*cluster.placement.destroyed.borrow(), vec![y]);
    assert_eq!(cluster.placement.counts.borrow().get(&c), Some(&0));
    assert_eq!(cluster.silo(&old_owner).directory().pending_handoffs(), 0);
}

#[tokio::test]
async fn test_dead_silo_entries_disappear() {
    let cluster = TestCluster::new(&[1, 2, 3]);
    let (a, b, c) = (silo(1), silo(2), silo(3));
    let grains: Vec<_> = (0..20).map(|i| grain(&format!("doomed-{i}"))).collect();
    for g in &grains {
        cluster
            .silo(&a)
            .directory()
            .register(activation(g, &b), cluster.ctx())
            .await
            .expect("register");
    }

    cluster
        .membership
        .update_status(&b, SiloStatus::Dead)
        .expect("mark dead");

    for s in [&a, &c] {
        let entries = cluster.silo(s).directory().entries();
        assert!(entries.iter().all(|e| e.address.silo != b));
    }
    for g in &grains {
        let found = cluster
            .silo(&c)
            .directory()
            .lookup(g.clone(), cluster.ctx())
            .await
            .expect("lookup");
        assert!(found.is_empty(), "{g}");
    }

    // A new activation takes the grain over.
    let replacement = activation(&grains[0], &c);
    let result = cluster
        .silo(&a)
        .directory()
        .register(replacement.clone(), cluster.ctx())
        .await
        .expect("register replacement");
    assert_eq!(result.address, Some(replacement));

    // And the dead silo's activations are refused.
    let result = cluster
        .silo(&a)
        .directory()
        .register(activation(&grains[1], &b), cluster.ctx())
        .await;
    assert_eq!(result, Err(DirectoryError::InvalidSilo(b)));
}

#[tokio::test]
async fn test_locator_drops_cache_for_dead_silo() {
    let cluster = TestCluster::new(&[1, 2]);
    let (a, b) = (silo(1), silo(2));
    let locator = cluster.silo(&a).locator();
    let grain = grain("cached");

    locator
        .register(activation(&grain, &b))
        .await
        .expect("register");
    assert!(locator.try_local_lookup(&grain).is_some());

    cluster
        .membership
        .update_status(&b, SiloStatus::Dead)
        .expect("mark dead");
    assert!(locator.try_local_lookup(&grain).is_none());
    let found = locator.lookup(&grain).await.expect("lookup");
    assert!(found.is_empty());
}
