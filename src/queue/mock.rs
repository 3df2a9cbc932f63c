//! In-memory queue used by the worker pool and drainer tests.

use super::{MailQueue, QueueError, QueueMessage};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

#[derive(Default)]
pub(crate) struct MockQueue {
    pending: Mutex<VecDeque<QueueMessage>>,
    acked: Mutex<Vec<String>>,
    dead: Mutex<Vec<(String, HashMap<String, String>)>>,
    fetch_count: Mutex<u32>,
    failing_fetches: Mutex<u32>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: QueueMessage) {
        self.pending.lock().unwrap().push_back(message);
    }

    pub fn push_json(&self, message_id: &str, body: &str) {
        self.push(QueueMessage {
            message_id: message_id.to_owned(),
            receipt: format!("receipt-{message_id}"),
            body: body.to_owned(),
            attributes: HashMap::new(),
        });
    }

    /// Make the next `count` fetches fail with a transient error.
    pub fn fail_fetches(&self, count: u32) {
        *self.failing_fetches.lock().unwrap() = count;
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    pub fn dead_letters(&self) -> Vec<(String, HashMap<String, String>)> {
        self.dead.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> u32 {
        *self.fetch_count.lock().unwrap()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[async_trait]
impl MailQueue for MockQueue {
    async fn fetch(&self, max: usize, _wait_seconds: u64) -> Result<Vec<QueueMessage>, QueueError> {
        *self.fetch_count.lock().unwrap() += 1;

        {
            let mut failing = self.failing_fetches.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(QueueError::Fetch("simulated outage".to_owned()));
            }
        }

        let mut pending = self.pending.lock().unwrap();
        let count = max.min(pending.len());
        Ok(pending.drain(..count).collect())
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        self.acked.lock().unwrap().push(receipt.to_owned());
        Ok(())
    }

    async fn dead_letter(
        &self,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), QueueError> {
        self.dead
            .lock()
            .unwrap()
            .push((body.to_owned(), attributes.clone()));
        Ok(())
    }
}
