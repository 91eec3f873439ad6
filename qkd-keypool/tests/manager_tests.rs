//! Key buffer manager tests
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


mod common;

use common::{ids, pool_config, MockKme};
use qkd_client::ProtocolError;
use qkd_keypool::{KeyBufferManager, PoolError};
use qkd_types::KeyState;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const DAY: Duration = Duration::from_secs(86_400);

#[tokio::test]
async fn test_concurrent_consumers_never_share_a_key() {
    let kme = MockKme::master();
    let manager = Arc::new(KeyBufferManager::start(kme.clone(), pool_config(100, 100, DAY)).unwrap());
    assert_eq!(manager.refill_now().await.unwrap(), 100);

    let mut tasks = Vec::new();
    for worker in 0..20 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            let mut issued = Vec::new();
            for _ in 0..5 {
                let key = manager.consume(&format!("worker-{}", worker)).await.unwrap();
                assert_eq!(key.state(), KeyState::Consumed);
                issued.push(key.key_id().to_string());
            }
            issued
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);

    assert!(matches!(
        manager.consume("late").await,
        Err(PoolError::BufferExhausted)
    ));
}

#[tokio::test]
async fn test_refill_requests_only_the_deficit() {
    let kme = MockKme::master();
    let manager = KeyBufferManager::start(kme.clone(), pool_config(5, 20, DAY)).unwrap();

    assert_eq!(manager.refill_now().await.unwrap(), 5);
    for _ in 0..3 {
        manager.consume("test").await.unwrap();
    }
    assert_eq!(manager.stats().available, 2);

    assert_eq!(manager.refill_now().await.unwrap(), 3);
    assert_eq!(kme.requested_numbers(), vec![5, 3]);

    // At min_keys nothing is requested
    assert_eq!(manager.refill_now().await.unwrap(), 0);
    assert_eq!(kme.requested_numbers(), vec![5, 3]);

    manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_failed_refill_releases_reservation() {
    let kme = MockKme::master();
    kme.fail_enc_keys(ProtocolError::ServiceUnavailable("depleted".to_string()), 1);
    let manager = KeyBufferManager::start(kme.clone(), pool_config(4, 10, DAY)).unwrap();

    assert!(matches!(
        manager.refill_now().await,
        Err(PoolError::Protocol(ProtocolError::ServiceUnavailable(_)))
    ));
    assert_eq!(manager.stats().reserved, 0);

    assert_eq!(manager.refill_now().await.unwrap(), 4);
    assert_eq!(kme.requested_numbers(), vec![4, 4]);

    let stats = manager.refill_stats().unwrap();
    assert_eq!(stats.failed_cycles, 1);
    assert_eq!(stats.successful_cycles, 1);
    assert_eq!(stats.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_refill_returns_its_reservation() {
    let kme = MockKme::master();
    kme.stall_next_enc_keys(Duration::from_secs(30));
    let manager = KeyBufferManager::start(kme.clone(), pool_config(5, 5, DAY)).unwrap();

    let cancelled = tokio::time::timeout(Duration::from_secs(1), manager.refill_now()).await;
    assert!(cancelled.is_err());

    assert_eq!(manager.refill_now().await.unwrap(), 5);
    assert_eq!(kme.requested_numbers(), vec![5, 5]);
    let stats = manager.stats();
    assert_eq!(stats.available, 5);
    assert_eq!(stats.reserved, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_import_returns_its_reservation() {
    let kme = MockKme::slave();
    kme.stall_next_dec_keys(Duration::from_secs(30));
    let manager = KeyBufferManager::start(kme.clone(), pool_config(0, 3, DAY)).unwrap();

    let cancelled = tokio::time::timeout(
        Duration::from_secs(1),
        manager.import_external_keys(&ids(&["k1", "k2", "k3"])),
    )
    .await;
    assert!(cancelled.is_err());

    assert_eq!(
        manager
            .import_external_keys(&ids(&["k1", "k2", "k3"]))
            .await
            .unwrap(),
        3
    );
    assert_eq!(manager.stats().reserved, 0);
}

#[tokio::test]
async fn test_refill_of_only_known_ids_backs_off() {
    let kme = MockKme::master();
    let manager = KeyBufferManager::start(kme.clone(), pool_config(2, 2, DAY)).unwrap();
    assert_eq!(manager.refill_now().await.unwrap(), 2);
    for _ in 0..2 {
        manager.consume("test").await.unwrap();
    }

    kme.reuse_ids();
    assert!(matches!(
        manager.refill_now().await,
        Err(PoolError::Protocol(ProtocolError::MalformedResponse(_)))
    ));

    let stats = manager.refill_stats().unwrap();
    assert_eq!(stats.consecutive_failures, 1);
    assert_eq!(stats.current_backoff, Duration::from_millis(100));
    assert_eq!(manager.stats().reserved, 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_keys_are_not_issued() {
    let kme = MockKme::master();
    let manager =
        KeyBufferManager::start(kme.clone(), pool_config(3, 10, Duration::from_secs(10))).unwrap();
    assert_ok!(manager.refill_now().await);

    tokio::time::advance(Duration::from_secs(11)).await;

    assert!(matches!(
        manager.consume("stale").await,
        Err(PoolError::BufferExhausted)
    ));
    let stats = manager.stats();
    assert_eq!(stats.available, 0);
    assert_eq!(stats.expired_total, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_expired_reports_evictions() {
    let kme = MockKme::master();
    let manager =
        KeyBufferManager::start(kme.clone(), pool_config(2, 10, Duration::from_secs(10))).unwrap();
    manager.refill_now().await.unwrap();

    assert_eq!(manager.cleanup_expired().await.unwrap(), 0);
    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(manager.cleanup_expired().await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refill_backoff_grows_and_is_capped() {
    let kme = MockKme::master();
    kme.fail_enc_keys(ProtocolError::ServiceUnavailable("busy".to_string()), 3);

    let mut config = pool_config(5, 20, DAY);
    config.auto_refill = true;
    let manager = KeyBufferManager::start(kme.clone(), config).unwrap();

    // Becomes available once the fourth attempt succeeds
    let key = manager
        .consume_within("test", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(key.state(), KeyState::Consumed);

    let times = kme.enc_call_times();
    assert!(times.len() >= 4);
    let delays: Vec<Duration> = times.windows(2).take(3).map(|w| w[1] - w[0]).collect();

    assert!(delays[0] >= Duration::from_millis(100));
    assert!(delays[0] < delays[1]);
    assert!(delays[1] < delays[2]);
    assert!(delays.iter().all(|d| *d <= Duration::from_secs(1) + Duration::from_millis(5)));

    let stats = manager.refill_stats().unwrap();
    assert_eq!(stats.failed_cycles, 3);
    assert_eq!(stats.consecutive_failures, 0);

    manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_consume_within_times_out() {
    let kme = MockKme::slave();
    let manager = KeyBufferManager::start(kme, pool_config(0, 10, DAY)).unwrap();

    let started = tokio::time::Instant::now();
    let result = manager.consume_within("test", Duration::from_secs(2)).await;
    assert!(matches!(result, Err(PoolError::BufferExhausted)));
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_consume_within_wakes_on_import() {
    let kme = MockKme::slave();
    let manager = Arc::new(KeyBufferManager::start(kme, pool_config(0, 10, DAY)).unwrap());

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.consume_within("test", Duration::from_secs(30)).await })
    };
    tokio::task::yield_now().await;

    manager.import_external_keys(&ids(&["k1"])).await.unwrap();

    let key = waiter.await.unwrap().unwrap();
    assert_eq!(key.key_id(), "k1");
}

#[tokio::test]
async fn test_import_preserves_order_and_rejects_reuse() {
    let kme = MockKme::slave();
    let manager = KeyBufferManager::start(kme.clone(), pool_config(0, 10, DAY)).unwrap();

    assert_eq!(manager.import_external_keys(&ids(&["k1", "k2"])).await.unwrap(), 2);
    assert_eq!(manager.consume("a").await.unwrap().key_id(), "k1");
    assert_eq!(manager.consume("b").await.unwrap().key_id(), "k2");

    // The KME would never hand out k1 twice; the buffer refuses it anyway
    assert_eq!(manager.import_external_keys(&ids(&["k1"])).await.unwrap(), 0);
    assert_eq!(manager.stats().rejected_total, 1);
    assert_eq!(manager.stats().imported_total, 2);
}

#[tokio::test]
async fn test_import_capacity_checked_before_fetch() {
    let kme = MockKme::slave();
    let manager = KeyBufferManager::start(kme.clone(), pool_config(0, 3, DAY)).unwrap();

    assert_eq!(
        manager
            .import_external_keys(&ids(&["k1", "k2", "k3", "k4"]))
            .await
            .unwrap_err(),
        PoolError::CapacityExceeded {
            requested: 4,
            available: 3
        }
    );
    assert!(kme.dec_calls().is_empty());

    assert_ok!(manager.import_external_keys(&ids(&["k1", "k2"])).await);
    assert_eq!(
        manager
            .import_external_keys(&ids(&["k3", "k4"]))
            .await
            .unwrap_err(),
        PoolError::CapacityExceeded {
            requested: 2,
            available: 1
        }
    );
    assert!(manager.stats().available <= 3);
}

#[tokio::test]
async fn test_import_unknown_id_adds_nothing() {
    let kme = MockKme::slave();
    kme.forget("k2");
    let manager = KeyBufferManager::start(kme.clone(), pool_config(0, 10, DAY)).unwrap();

    match manager.import_external_keys(&ids(&["k1", "k2"])).await {
        Err(PoolError::Protocol(ProtocolError::KeyIdNotFound { missing, .. })) => {
            assert_eq!(missing, vec!["k2"])
        }
        other => panic!("unexpected result: {:?}", other),
    }
    let stats = manager.stats();
    assert_eq!(stats.available, 0);
    assert_eq!(stats.reserved, 0);
}

#[tokio::test]
async fn test_role_restrictions() {
    let master = KeyBufferManager::start(MockKme::master(), pool_config(0, 10, DAY)).unwrap();
    assert!(matches!(
        master.import_external_keys(&ids(&["k1"])).await,
        Err(PoolError::RoleMismatch(_))
    ));

    let slave = KeyBufferManager::start(MockKme::slave(), pool_config(0, 10, DAY)).unwrap();
    assert!(matches!(
        slave.refill_now().await,
        Err(PoolError::RoleMismatch(_))
    ));
}

#[tokio::test]
async fn test_configure_validates_and_shrinks() {
    let kme = MockKme::master();
    let manager = KeyBufferManager::start(kme, pool_config(6, 10, DAY)).unwrap();
    assert_ok!(manager.refill_now().await);

    assert_err!(manager.configure(5, 0, DAY).await);
    assert!(matches!(
        manager.configure(8, 4, DAY).await,
        Err(PoolError::Configuration(_))
    ));
    assert!(matches!(
        manager.configure(1, 4, Duration::ZERO).await,
        Err(PoolError::Configuration(_))
    ));

    assert_eq!(manager.configure(2, 4, DAY).await.unwrap(), 2);
    let stats = manager.stats();
    assert_eq!(stats.available, 4);
    assert_eq!(stats.max_keys, 4);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_bounded() {
    let mut config = pool_config(5, 20, DAY);
    config.auto_refill = true;
    let manager = KeyBufferManager::start(MockKme::master(), config).unwrap();
    tokio::task::yield_now().await;

    let started = tokio::time::Instant::now();
    manager.shutdown(Duration::from_secs(5)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
}
