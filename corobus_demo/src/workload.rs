use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use corobus_core::{Bus, BusConfig, BusError, BusStats, ChannelHandle};
use serde::Serialize;
use tokio::sync::Notify;

// Values carry the producer id in the high bits and a sequence number in the
// low bits, so consumers can check per-producer ordering.
const SEQ_BITS: u32 = 20;
const SEQ_MASK: u32 = (1 << SEQ_BITS) - 1;

fn encode(producer: u32, seq: u32) -> u32 {
    (producer << SEQ_BITS) | seq
}

fn decode(value: u32) -> (u32, u32) {
    (value >> SEQ_BITS, value & SEQ_MASK)
}

#[derive(Debug, Clone)]
pub struct Workload {
    pub capacity: usize,
    pub producers: u32,
    pub consumers: u32,
    pub messages: u32,
    pub batch: Option<usize>,
}

#[derive(Serialize, Debug)]
pub struct Summary {
    pub capacity: usize,
    pub expected: u64,
    pub delivered: u64,
    pub per_consumer: Vec<u64>,
    pub in_order: bool,
    pub stats: BusStats,
}

impl Workload {
    /// Runs producers and consumers over one channel until every value has
    /// been delivered. Must be called inside a `LocalSet`.
    pub async fn run(self, config: BusConfig) -> anyhow::Result<Summary> {
        anyhow::ensure!(self.messages <= SEQ_MASK, "At most {SEQ_MASK} messages per producer");
        anyhow::ensure!(
            self.producers < 1 << (32 - SEQ_BITS),
            "At most {} producers",
            (1u32 << (32 - SEQ_BITS)) - 1
        );
        anyhow::ensure!(
            self.consumers > 0 || self.producers == 0 || self.messages == 0,
            "Producers need at least one consumer"
        );

        let bus: Rc<Bus> = Rc::new(Bus::with_config(config));
        let handle = bus.open(self.capacity);
        let expected = u64::from(self.producers) * u64::from(self.messages);
        let delivered = Rc::new(Cell::new(0u64));
        let in_order = Rc::new(Cell::new(true));
        let drained = Rc::new(Notify::new());

        let producers: Vec<_> = (0..self.producers)
            .map(|id| {
                tokio::task::spawn_local(produce(
                    bus.clone(),
                    handle,
                    id,
                    self.messages,
                    self.batch,
                ))
            })
            .collect();
        let consumers: Vec<_> = (0..self.consumers)
            .map(|id| {
                tokio::task::spawn_local(consume(
                    bus.clone(),
                    handle,
                    id,
                    Tally {
                        expected,
                        delivered: delivered.clone(),
                        in_order: in_order.clone(),
                        drained: drained.clone(),
                    },
                ))
            })
            .collect();

        for producer in producers {
            producer.await??;
        }
        if expected > 0 {
            drained.notified().await;
        }
        // Nothing is buffered any more; closing releases idle consumers.
        bus.close(handle);

        let mut per_consumer = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            per_consumer.push(consumer.await?);
        }

        Ok(Summary {
            capacity: self.capacity,
            expected,
            delivered: delivered.get(),
            per_consumer,
            in_order: in_order.get(),
            stats: bus.stats(),
        })
    }
}

async fn produce(
    bus: Rc<Bus>,
    handle: ChannelHandle,
    id: u32,
    messages: u32,
    batch: Option<usize>,
) -> Result<(), BusError> {
    let values: Vec<u32> = (0..messages).map(|seq| encode(id, seq)).collect();
    match batch {
        Some(size) if size > 1 => {
            let mut rest = values.as_slice();
            while !rest.is_empty() {
                let chunk = &rest[..size.min(rest.len())];
                let sent = bus.send_v(handle, chunk).await?;
                rest = &rest[sent..];
            }
        }
        _ => {
            for value in values {
                bus.send(handle, value).await?;
            }
        }
    }
    log::debug!("producer {id} sent {messages} values");
    Ok(())
}

/// Delivery bookkeeping shared by all consumers.
struct Tally {
    expected: u64,
    delivered: Rc<Cell<u64>>,
    in_order: Rc<Cell<bool>>,
    // Signalled once by the consumer that receives the last value.
    drained: Rc<Notify>,
}

impl Tally {
    fn record(&self) {
        let delivered = self.delivered.get() + 1;
        self.delivered.set(delivered);
        if delivered == self.expected {
            self.drained.notify_one();
        }
    }
}

async fn consume(bus: Rc<Bus>, handle: ChannelHandle, id: u32, tally: Tally) -> u64 {
    let mut last_seq: HashMap<u32, u32> = HashMap::new();
    let mut count = 0;
    while let Ok(value) = bus.recv(handle).await {
        let (producer, seq) = decode(value);
        if let Some(previous) = last_seq.insert(producer, seq) {
            if previous >= seq {
                log::warn!("consumer {id}: producer {producer} sent {seq} after {previous}");
                tally.in_order.set(false);
            }
        }
        count += 1;
        tally.record();
    }
    log::debug!("consumer {id} received {count} values");
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::task::LocalSet;

    fn workload(capacity: usize, batch: Option<usize>) -> Workload {
        Workload {
            capacity,
            producers: 3,
            consumers: 2,
            messages: 50,
            batch,
        }
    }

    #[test]
    fn values_round_trip_through_the_encoding() {
        assert_eq!(decode(encode(7, 12345)), (7, 12345));
    }

    #[test_log::test(tokio::test)]
    async fn every_value_is_delivered_in_producer_order() {
        let summary = LocalSet::new()
            .run_until(workload(2, None).run(BusConfig::default()))
            .await
            .unwrap();

        assert_eq!(summary.delivered, 150);
        assert_eq!(summary.per_consumer.iter().sum::<u64>(), 150);
        assert!(summary.in_order);
        assert_eq!(summary.stats.values_received, 150);
    }

    #[test_log::test(tokio::test)]
    async fn batched_rendezvous_workload_completes() {
        let summary = LocalSet::new()
            .run_until(workload(0, Some(4)).run(BusConfig::default()))
            .await
            .unwrap();

        assert_eq!(summary.delivered, 150);
        assert!(summary.in_order);
    }

    #[test_log::test(tokio::test)]
    async fn driver_closes_the_channel_once_drained() {
        let summary = LocalSet::new()
            .run_until(workload(1, None).run(BusConfig::default()))
            .await
            .unwrap();
        assert_eq!(summary.delivered, summary.expected);
        assert_eq!(summary.stats.channels_closed, 1);

        let empty = Workload {
            messages: 0,
            ..workload(1, None)
        };
        let summary = LocalSet::new()
            .run_until(empty.run(BusConfig::default()))
            .await
            .unwrap();
        assert_eq!(summary.per_consumer, vec![0, 0]);
    }

    #[test_log::test(tokio::test)]
    async fn batches_fail_when_disabled() {
        let result = LocalSet::new()
            .run_until(workload(4, Some(4)).run(BusConfig::default().with_batch(false)))
            .await;
        assert!(result.is_err());
    }
}
