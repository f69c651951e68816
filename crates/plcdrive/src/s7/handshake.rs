use std::sync::Mutex;
use std::sync::MutexGuard;

use plcrpc::Conversation;
use plcrpc::Handshake;
use plcrpc::Key;
use plcrpc::Transition;

use crate::config::ControllerType;
use crate::config::S7Config;
use crate::s7::message::CPU_FUNCTIONS;
use crate::s7::message::CotpParameter;
use crate::s7::message::Parameter;
use crate::s7::message::Payload;
use crate::s7::message::S7Message;
use crate::s7::message::SUBFUNCTION_READ_SZL;
use crate::s7::message::SZL_MODULE_IDENTIFICATION;
use crate::s7::message::SzlItem;
use crate::s7::message::Tpkt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7Step {
    /// The connection was set up by someone else; nothing to negotiate.
    Passive,
    CotpConnect,
    SetupCommunication,
    Identify,
}

/// What the PLC agreed to during connection setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub calling_tsap: u16,
    pub called_tsap: u16,
    pub tpdu_size: u16,
    pub max_amq_caller: u16,
    pub max_amq_callee: u16,
    pub pdu_size: u16,
    pub controller_type: ControllerType,
}

pub(crate) struct S7Handshake {
    config: S7Config,
    negotiated: Mutex<Negotiated>,
}

impl S7Handshake {
    pub(crate) fn new(config: &S7Config) -> Self {
        Self {
            negotiated: Mutex::new(Negotiated {
                calling_tsap: config.calling_tsap,
                called_tsap: config.called_tsap,
                tpdu_size: config.tpdu_size,
                max_amq_caller: config.max_amq_caller,
                max_amq_callee: config.max_amq_callee,
                pdu_size: config.pdu_size,
                controller_type: config.controller_type,
            }),
            config: config.clone(),
        }
    }

    fn negotiated(&self) -> MutexGuard<'_, Negotiated> {
        self.negotiated.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn cotp_connect(&self, conversation: &Conversation<Tpkt>) -> plcrpc::Result<S7Step> {
        let request = {
            let n = self.negotiated();
            Tpkt::ConnectionRequest { called_tsap: n.called_tsap, calling_tsap: n.calling_tsap, tpdu_size: n.tpdu_size }
        };

        let _slot = conversation.transactions().acquire().await?;
        let parameters = conversation
            .request(request)
            .expect_response(Key::Uncorrelated, self.config.request_timeout)
            .only(|p| match p {
                Tpkt::ConnectionConfirm { parameters } => Some(parameters),
                _ => None,
            })
            .on_timeout(|_| tracing::warn!("timeout during connection establishment"))
            .send()
            .await?;
        tracing::debug!("got COTP connection confirm");

        let mut n = self.negotiated();
        for parameter in parameters {
            match parameter {
                CotpParameter::CalledTsap(tsap) => n.called_tsap = tsap,
                CotpParameter::CallingTsap(tsap) => {
                    if tsap != n.calling_tsap {
                        tracing::warn!(tsap, "switching calling TSAP id");
                        n.calling_tsap = tsap;
                    }
                }
                CotpParameter::TpduSize(size) => n.tpdu_size = size,
            }
        }
        Ok(S7Step::SetupCommunication)
    }

    async fn setup_communication(
        &self,
        conversation: &Conversation<Tpkt>,
    ) -> plcrpc::Result<Transition<S7Step, Negotiated>> {
        let parameter = {
            let n = self.negotiated();
            Parameter::SetupCommunication {
                max_amq_caller: n.max_amq_caller,
                max_amq_callee: n.max_amq_callee,
                pdu_length: n.pdu_size,
            }
        };
        let request = Tpkt::data(1, S7Message::Request { reference: 0, parameter, payload: Payload::None });

        let _slot = conversation.transactions().acquire().await?;
        let (caller, callee, pdu) = conversation
            .request(request)
            .expect_response(Key::Uncorrelated, self.config.request_timeout)
            .only(Tpkt::into_message)
            .only(|m| match m {
                S7Message::Response { error_class, error_code, .. } if (error_class, error_code) != (0, 0) => {
                    let message = format!("setup communication rejected (class 0x{:02x})", error_class);
                    Some(Err(plcrpc::Error::protocol(u32::from(error_code), message)))
                }
                S7Message::Response {
                    parameter: Parameter::SetupCommunication { max_amq_caller, max_amq_callee, pdu_length },
                    ..
                } => Some(Ok((max_amq_caller, max_amq_callee, pdu_length))),
                _ => None,
            })
            .on_timeout(|_| tracing::warn!("timeout during connection establishment"))
            .send()
            .await??;
        tracing::debug!(max_amq_caller = caller, max_amq_callee = callee, pdu_size = pdu, "communication set up");

        let controller_type = {
            let mut n = self.negotiated();
            n.max_amq_caller = caller;
            n.max_amq_callee = callee;
            n.pdu_size = pdu;
            n.controller_type
        };

        // Only outgoing requests are limited, so the callee's queue is what counts.
        conversation.transactions().set_concurrency_limit(usize::from(callee));

        if controller_type != ControllerType::Any {
            return Ok(Transition::Done(self.negotiated().clone()));
        }
        Ok(Transition::Next(S7Step::Identify))
    }

    async fn identify(&self, conversation: &Conversation<Tpkt>) -> plcrpc::Result<Transition<S7Step, Negotiated>> {
        let request = Tpkt::data(
            2,
            S7Message::UserData {
                reference: 1,
                parameter: Parameter::CpuFunction {
                    method: 0x11,
                    function_group: CPU_FUNCTIONS,
                    subfunction: SUBFUNCTION_READ_SZL,
                    sequence: 0,
                },
                payload: Payload::SzlRequest { szl_id: SZL_MODULE_IDENTIFICATION, index: 0x0000 },
            },
        );

        let _slot = conversation.transactions().acquire().await?;
        let items = conversation
            .request(request)
            .expect_response(Key::Id(1), self.config.request_timeout)
            .only(Tpkt::into_message)
            .only(|m| match m {
                S7Message::UserData { payload: Payload::SzlResponse { items }, .. } => Some(items),
                _ => None,
            })
            .on_timeout(|_| tracing::warn!("timeout during connection establishment"))
            .send()
            .await?;

        let controller_type = identification(&items)
            .map(|item| ControllerType::from_article_number(&item.article_number))
            .unwrap_or(ControllerType::Any);
        tracing::debug!(?controller_type, "controller identified");

        let mut n = self.negotiated();
        n.controller_type = controller_type;
        Ok(Transition::Done(n.clone()))
    }
}

fn identification(items: &[SzlItem]) -> Option<&SzlItem> {
    items.iter().find(|item| item.index == 0x0001)
}

#[async_trait::async_trait]
impl Handshake<Tpkt> for S7Handshake {
    type Step = S7Step;
    type Outcome = Negotiated;

    fn first_step(&self) -> S7Step {
        if self.config.passive { S7Step::Passive } else { S7Step::CotpConnect }
    }

    async fn step(
        &self,
        step: &S7Step,
        conversation: &Conversation<Tpkt>,
    ) -> plcrpc::Result<Transition<S7Step, Negotiated>> {
        match step {
            S7Step::Passive => {
                tracing::info!("S7 driver running in passive mode");
                Ok(Transition::Done(self.negotiated().clone()))
            }
            S7Step::CotpConnect => self.cotp_connect(conversation).await.map(Transition::Next),
            S7Step::SetupCommunication => self.setup_communication(conversation).await,
            S7Step::Identify => self.identify(conversation).await,
        }
    }
}
