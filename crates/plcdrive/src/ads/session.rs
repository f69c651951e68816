use plcrpc::Conversation;
use plcrpc::Key;

use crate::ads::message::AdsData;
use crate::ads::message::AmsPacket;
use crate::config::AdsConfig;

/// The conversation with one ADS device, shared by the driver and its symbol
/// resolver.
pub(crate) struct Session {
    conversation: Conversation<AmsPacket>,
    config: AdsConfig,
}

impl Session {
    pub(crate) fn new(conversation: Conversation<AmsPacket>, config: AdsConfig) -> Self {
        Self { conversation, config }
    }

    pub(crate) fn conversation(&self) -> &Conversation<AmsPacket> {
        &self.conversation
    }

    /// Sends one request in its own transaction and returns the answer's payload.
    pub(crate) async fn exchange(&self, data: AdsData) -> plcrpc::Result<AdsData> {
        let slot = self.conversation.transactions().acquire().await?;
        let invoke_id = self.conversation.next_invoke_id()?;
        let packet = AmsPacket::new(self.config.target, self.config.source, invoke_id, data);

        let outcome = self
            .conversation
            .request(packet)
            .expect_response(Key::Id(invoke_id), self.config.request_timeout)
            .check(move |p| p.invoke_id == invoke_id)
            .send()
            .await
            .and_then(|response| {
                if response.error_code != 0 {
                    tracing::warn!(invoke_id, error_code = response.error_code, "AMS error response");
                    return Err(plcrpc::Error::protocol(response.error_code, "AMS header error"));
                }
                Ok(response.data)
            });
        match &outcome {
            Ok(_) => slot.end(),
            Err(error) => slot.fail(error),
        }
        outcome
    }
}
