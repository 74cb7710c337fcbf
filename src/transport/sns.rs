// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! AWS SNS backend for the polling transport.
//!
//! Credentials and region come from the ambient AWS configuration (env vars,
//! profile, instance role); the region can be overridden per relay. The
//! target is a topic ARN. The routing key travels as the `EventType` string
//! message attribute so subscribers can filter on it.

use super::{BoxFuture, PollingClient, PollingConnector};
use crate::error::BrokerError;
use aws_sdk_sns::types::MessageAttributeValue;
use tracing::{debug, info};

const TRANSPORT: &str = "sns";

/// Message attribute carrying the routing key.
pub const ROUTING_ATTRIBUTE: &str = "EventType";

/// Builds SNS clients from the ambient AWS configuration.
#[derive(Debug, Clone, Default)]
pub struct SnsConnector {
    region: Option<String>,
}

impl SnsConnector {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }
}

impl PollingConnector for SnsConnector {
    fn name(&self) -> &'static str {
        TRANSPORT
    }

    fn open(&self) -> BoxFuture<'_, Box<dyn PollingClient>> {
        Box::pin(async move {
            let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(region) = &self.region {
                builder = builder.region(aws_config::Region::new(region.clone()));
            }
            let sdk_config = builder.load().await;
            let client = aws_sdk_sns::Client::new(&sdk_config);

            info!(
                region = ?sdk_config.region().map(|r| r.to_string()),
                "SNS client initialized"
            );
            Ok(Box::new(SnsClient { client }) as Box<dyn PollingClient>)
        })
    }
}

/// One SNS client handle.
#[derive(Debug, Clone)]
pub struct SnsClient {
    client: aws_sdk_sns::Client,
}

impl PollingClient for SnsClient {
    fn check_target<'a>(&'a self, target: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .get_topic_attributes()
                .topic_arn(target)
                .send()
                .await
                .map_err(|e| {
                    BrokerError::connection(
                        TRANSPORT,
                        format!(
                            "Topic {} is not reachable: {}",
                            target,
                            aws_sdk_sns::error::DisplayErrorContext(&e)
                        ),
                    )
                })?;
            debug!(topic = target, "Topic exists");
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        target: &'a str,
        routing_key: &'a str,
        body: String,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut request = self.client.publish().topic_arn(target).message(body);

            if !routing_key.is_empty() {
                let attribute = MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(routing_key)
                    .build()
                    .map_err(|e| BrokerError::publish(TRANSPORT, e.to_string()))?;
                request = request.message_attributes(ROUTING_ATTRIBUTE, attribute);
            }

            let output = request.send().await.map_err(|e| {
                BrokerError::publish(
                    TRANSPORT,
                    aws_sdk_sns::error::DisplayErrorContext(&e).to_string(),
                )
            })?;

            Ok(output.message_id().unwrap_or_default().to_string())
        })
    }
}
