use super::{MAX_FETCH, MAX_WAIT_SECONDS, MailQueue, QueueError, QueueMessage};
use crate::config::QueueConfig;
use async_trait::async_trait;
use aws_sdk_sqs::types::MessageAttributeValue;
use std::collections::HashMap;
use tracing::debug;

/// SQS-backed queue pair: the source queue plus its dead-letter sibling.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    config: QueueConfig,
}

impl SqsQueue {
    pub async fn from_env(config: QueueConfig) -> Self {
        let aws_config = aws_config::load_from_env().await;

        Self {
            client: aws_sdk_sqs::Client::new(&aws_config),
            config,
        }
    }

    pub fn new(client: aws_sdk_sqs::Client, config: QueueConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl MailQueue for SqsQueue {
    async fn fetch(&self, max: usize, wait_seconds: u64) -> Result<Vec<QueueMessage>, QueueError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.config.queue_url)
            .max_number_of_messages(max.min(MAX_FETCH) as i32)
            .wait_time_seconds(wait_seconds.min(MAX_WAIT_SECONDS) as i32)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::Fetch(e.to_string()))?;

        let messages: Vec<QueueMessage> = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|message| QueueMessage {
                message_id: message.message_id.unwrap_or_default(),
                receipt: message.receipt_handle.unwrap_or_default(),
                body: message.body.unwrap_or_default(),
                attributes: message
                    .message_attributes
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|(name, value)| value.string_value.map(|text| (name, text)))
                    .collect(),
            })
            .collect();

        debug!(count = messages.len(), "fetched messages from queue");
        Ok(messages)
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.config.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))?;

        Ok(())
    }

    async fn dead_letter(
        &self,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), QueueError> {
        let mut forwarded = HashMap::with_capacity(attributes.len());
        for (name, value) in attributes {
            let attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|e| QueueError::DeadLetter(e.to_string()))?;
            forwarded.insert(name.clone(), attribute);
        }

        self.client
            .send_message()
            .queue_url(&self.config.dead_letter_url)
            .message_body(body)
            .set_message_attributes((!forwarded.is_empty()).then_some(forwarded))
            .send()
            .await
            .map_err(|e| QueueError::DeadLetter(e.to_string()))?;

        Ok(())
    }
}
