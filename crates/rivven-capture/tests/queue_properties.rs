//! Randomized checks of queue accounting and offset monotonicity.

use rivven_capture::config::QueueConfig;
use rivven_capture::{
    CaptureError, ChangeEvent, EventOp, EventQueue, LogPosition, Offset, OffsetState, Partition,
    TableId,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::time::Duration;

fn event(n: u64) -> ChangeEvent {
    ChangeEvent::change(
        Partition::new("server1", "inventory"),
        TableId::new("inventory", "orders"),
        EventOp::Insert,
        json!(n),
        None,
        Some(json!({"id": n})),
        Offset::Log(LogPosition::new("mysql-bin.000001", 4 + n * 100)),
        0,
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Buffer {
    Off,
    Armed,
    Holding,
    Retired,
}

#[tokio::test]
async fn test_queue_accounts_for_every_event() {
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let queue = EventQueue::new(QueueConfig {
            max_queue_size: 10_000,
            max_batch_size: 7,
            ..Default::default()
        });
        let mut buffer = Buffer::Off;
        let mut next = 0u64;
        let mut polled = Vec::new();

        for _ in 0..300 {
            match rng.gen_range(0..10) {
                0..=4 => {
                    next += 1;
                    queue.enqueue(event(next)).await.unwrap();
                    if buffer == Buffer::Armed {
                        buffer = Buffer::Holding;
                    }
                }
                5..=6 => {
                    let batch = queue.poll_timeout(Duration::ZERO).await.unwrap();
                    assert!(batch.len() <= 7);
                    polled.extend(batch.into_iter().filter_map(|e| e.key.as_u64()));
                }
                7 => {
                    let result = queue.enable_buffering();
                    match buffer {
                        Buffer::Off | Buffer::Armed => {
                            result.unwrap();
                            buffer = Buffer::Armed;
                        }
                        Buffer::Holding | Buffer::Retired => {
                            assert!(matches!(result, Err(CaptureError::OrderingViolation(_))))
                        }
                    }
                }
                8 => {
                    queue.flush_buffer(|e| e);
                    if buffer == Buffer::Holding {
                        buffer = Buffer::Armed;
                    }
                }
                _ => {
                    queue.disable_buffering();
                    buffer = Buffer::Retired;
                }
            }

            let stats = queue.stats();
            assert_eq!(
                stats.enqueued,
                stats.polled + stats.queued + stats.buffered,
                "seed {}",
                seed
            );
            assert_eq!(stats.buffered, u64::from(buffer == Buffer::Holding), "seed {}", seed);
            assert_eq!(stats.enqueued, next);
        }

        queue.close();
        while let Ok(batch) = queue.poll_timeout(Duration::ZERO).await {
            polled.extend(batch.into_iter().filter_map(|e| e.key.as_u64()));
        }
        assert_eq!(polled, (1..=next).collect::<Vec<_>>(), "seed {}", seed);
    }
}

#[test]
fn test_offsets_never_move_backwards() {
    let partition = Partition::new("server1", "inventory");
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let offsets = OffsetState::new();
        let mut current: Option<(u32, u64)> = None;

        for _ in 0..200 {
            let candidate = (rng.gen_range(1..4u32), rng.gen_range(0..50u64) * 10);
            let offset = Offset::Log(LogPosition::new(
                format!("mysql-bin.{:06}", candidate.0),
                candidate.1,
            ));
            let accepted = offsets.advance_to(&partition, offset.clone(), None).is_ok();

            let expected = current.map_or(true, |c| candidate >= c);
            assert_eq!(accepted, expected, "seed {} candidate {:?}", seed, candidate);
            if accepted {
                current = Some(candidate);
            }
            let (file, position) = current.unwrap_or_default();
            assert_eq!(
                offsets.current_offset(&partition),
                current.map(|_| Offset::Log(LogPosition::new(format!("mysql-bin.{:06}", file), position)))
            );
        }
    }
}
