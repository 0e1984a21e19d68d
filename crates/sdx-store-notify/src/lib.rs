use std::time::Duration;

use sdx_store_core::TxId;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Seam between the store facade and the queue transport, so the service can
/// be exercised with a recording stub.
pub trait Publisher {
    /// Announce a message on the named queue. `true` means the message was
    /// accepted by a queue endpoint; `false` means the notification is lost
    /// and the caller must fail the overall request.
    fn publish(&self, queue: &str, message: &str, tx_id: &TxId) -> bool;
}

/// Publishes notifications to the first reachable endpoint of a prioritized
/// list. Every call is a fresh connect → declare → publish → disconnect
/// cycle; nothing is held open between calls, trading latency for immunity
/// to stale-connection bugs in long-lived workers.
pub struct HttpQueuePublisher {
    urls: Vec<String>,
    timeout: Duration,
}

impl HttpQueuePublisher {
    #[must_use]
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls, timeout: DEFAULT_TIMEOUT }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Declare the queue on one endpoint. Declaration is idempotent on the
    /// queue service side; success doubles as the connection check.
    fn declare(&self, agent: &ureq::Agent, base: &str, queue: &str) -> Result<(), ureq::Error> {
        agent.put(&format!("{base}/queues/{queue}")).call()?;
        Ok(())
    }

    fn post_message(
        &self,
        agent: &ureq::Agent,
        base: &str,
        queue: &str,
        message: &str,
        tx_id: &TxId,
    ) -> Result<(), ureq::Error> {
        agent
            .post(&format!("{base}/queues/{queue}/messages"))
            .set("x-tx-id", tx_id.as_str())
            .send_string(message)?;
        Ok(())
    }
}

impl Publisher for HttpQueuePublisher {
    fn publish(&self, queue: &str, message: &str, tx_id: &TxId) -> bool {
        tracing::debug!(queue, tx_id = %tx_id, "sending notification");
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.timeout)
            .timeout(self.timeout)
            .build();

        for base in &self.urls {
            let base = base.trim_end_matches('/');
            if let Err(err) = self.declare(&agent, base, queue) {
                tracing::error!(url = base, error = %err, "unable to connect to queue endpoint");
                continue;
            }
            tracing::debug!(url = base, queue, "connected to queue endpoint");

            // Connected and declared: a publish failure here is final, not
            // an occasion to fail over.
            return match self.post_message(&agent, base, queue, message, tx_id) {
                Ok(()) => {
                    tracing::debug!(queue, tx_id = %tx_id, "notification published");
                    true
                }
                Err(err) => {
                    tracing::error!(queue, error = %err, "unable to publish notification");
                    false
                }
            };
        }

        tracing::error!(queue, "no queue endpoint reachable");
        false
    }
}
