use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::sync::watch;

use plcrpc::Channel;
use plcrpc::ConnectionState;
use plcrpc::Conversation;
use plcrpc::InvokeId;
use plcrpc::Key;
use plcrpc::handshake;

use crate::api::Driver;
use crate::api::ReadItem;
use crate::api::ReadRequest;
use crate::api::ReadResponse;
use crate::api::ResponseCode;
use crate::api::StatusResponse;
use crate::api::SubscribeRequest;
use crate::api::UnsubscribeResponse;
use crate::api::WriteRequest;
use crate::api::WriteResponse;
use crate::config::S7Config;
use crate::error::Error;
use crate::error::Result;
use crate::s7::field::S7Field;
use crate::s7::handshake::Negotiated;
use crate::s7::handshake::S7Handshake;
use crate::s7::message::CPU_FUNCTIONS;
use crate::s7::message::DataItem;
use crate::s7::message::ERROR_ACCESS_DISABLED;
use crate::s7::message::EventType;
use crate::s7::message::Parameter;
use crate::s7::message::Payload;
use crate::s7::message::ReturnCode;
use crate::s7::message::S7Message;
use crate::s7::message::SUBFUNCTION_MSG_SERVICE;
use crate::s7::message::Tpkt;
use crate::subscription::Router;
use crate::subscription::Subscription;
use crate::subscription::SubscriptionHandle;

/// A connected S7 controller.
pub struct S7Driver {
    conversation: Arc<Conversation<Tpkt>>,
    config: S7Config,
    negotiated: Negotiated,
    router: Arc<Router<EventType>>,
}

impl S7Driver {
    /// Runs the connection handshake over `channel`.
    ///
    /// Fails with the handshake error if any setup step fails; the channel is
    /// closed in that case.
    pub async fn connect(channel: Arc<dyn Channel<Tpkt>>, config: S7Config) -> Result<Self> {
        let conversation = Arc::new(Conversation::new("s7", channel, config.conversation()));
        let router = Arc::new(Router::new());

        let events = router.clone();
        conversation.on_unsolicited(move |packet| route_push(&events, packet));

        let negotiated = handshake::run(&S7Handshake::new(&config), &conversation).await?;
        tracing::info!(
            pdu_size = negotiated.pdu_size,
            max_amq_callee = negotiated.max_amq_callee,
            controller_type = ?negotiated.controller_type,
            "S7 connection established"
        );

        Ok(Self { conversation, config, negotiated, router })
    }

    /// Parameters agreed during the handshake.
    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    pub fn conversation(&self) -> &Conversation<Tpkt> {
        &self.conversation
    }

    /// One admitted request/response exchange keyed by the PDU reference.
    async fn exchange(&self, build: impl FnOnce(u16) -> S7Message) -> Result<S7Message> {
        let slot = self.conversation.transactions().acquire().await?;
        let id = self.conversation.next_invoke_id()?;
        let reference = pdu_reference(id);

        let response = self
            .conversation
            .request(Tpkt::data(reference, build(reference)))
            .expect_response(Key::Id(id), self.config.request_timeout)
            .only(Tpkt::into_message)
            .check(move |m| m.reference() == reference)
            .send()
            .await;
        match &response {
            Ok(_) => slot.end(),
            Err(error) => slot.fail(error),
        }
        Ok(response?)
    }
}

/// Ids come from a generator whose ceiling is `0xFFFF`.
fn pdu_reference(id: InvokeId) -> u16 {
    u16::try_from(id).unwrap_or(u16::MAX)
}

/// Applies a header error to every item, or `None` if the header is clean.
fn header_error(message: &S7Message) -> Option<ResponseCode> {
    match message.error() {
        (0, 0) => None,
        ERROR_ACCESS_DISABLED => {
            tracing::warn!("PLC denied access; PUT/GET is probably not enabled");
            Some(ResponseCode::AccessDenied)
        }
        (class, code) => {
            tracing::warn!(class, code, "unknown error response from the PLC");
            Some(ResponseCode::InternalError)
        }
    }
}

fn expect_response(message: &S7Message) -> Result<()> {
    match message {
        S7Message::Response { .. } => Ok(()),
        other => Err(Error::malformed(format!("expected a response, got {:?}", other.parameter()))),
    }
}

fn decode_read(names: Vec<String>, message: &S7Message) -> Result<ReadResponse> {
    expect_response(message)?;
    if let Some(code) = header_error(message) {
        let items = names.into_iter().map(|name| ReadItem { name, code, value: None }).collect();
        return Ok(ReadResponse { items });
    }

    let Payload::Data(data) = message.payload() else {
        return Err(Error::malformed("read response carries no data items"));
    };
    if data.len() != names.len() {
        return Err(Error::malformed(format!("requested {} items, got {}", names.len(), data.len())));
    }

    let items = names
        .into_iter()
        .zip(data)
        .map(|(name, item)| {
            let code = ResponseCode::from(item.code);
            let value = code.is_ok().then(|| item.data.clone());
            ReadItem { name, code, value }
        })
        .collect();
    Ok(ReadResponse { items })
}

fn decode_write(names: Vec<String>, message: &S7Message) -> Result<WriteResponse> {
    expect_response(message)?;
    if let Some(code) = header_error(message) {
        return Ok(StatusResponse { items: names.into_iter().map(|name| (name, code)).collect() });
    }

    let Payload::Status(codes) = message.payload() else {
        return Err(Error::malformed("write response carries no status items"));
    };
    if codes.len() != names.len() {
        return Err(Error::malformed(format!("requested {} items, got {}", names.len(), codes.len())));
    }

    let items = names.into_iter().zip(codes).map(|(name, code)| (name, ResponseCode::from(*code))).collect();
    Ok(StatusResponse { items })
}

fn check_subscribed(message: &S7Message) -> Result<()> {
    let (class, code) = message.error();
    if (class, code) != (0, 0) {
        let reason = format!("event subscription rejected (class 0x{:02x})", class);
        return Err(plcrpc::Error::protocol(u32::from(code), reason).into());
    }
    match message.payload() {
        Payload::SubscribeResult { code: ReturnCode::Ok } => Ok(()),
        Payload::SubscribeResult { code } => {
            Err(plcrpc::Error::protocol(u32::from(code.code()), "event subscription rejected").into())
        }
        _ => Err(Error::malformed("subscription response carries no result")),
    }
}

/// Hands events the PLC pushes to their subscribers.
fn route_push(router: &Router<EventType>, packet: Tpkt) {
    let Some(message) = packet.into_message() else {
        tracing::debug!("ignoring unsolicited COTP packet");
        return;
    };
    let now = SystemTime::now();
    let delivered = match (message.parameter(), message.payload()) {
        (Parameter::ModeTransition { current_mode }, _) => router.deliver(&EventType::Mode, now, &[*current_mode]),
        (_, Payload::Push { event, data }) => router.deliver(event, now, data),
        _ => {
            tracing::debug!(reference = message.reference(), "ignoring unsolicited S7 message");
            return;
        }
    };
    tracing::trace!(delivered, "routed S7 push");
}

#[async_trait::async_trait]
impl Driver for S7Driver {
    type Field = S7Field;
    type Trigger = EventType;

    async fn read(&self, request: ReadRequest<S7Field>) -> Result<ReadResponse> {
        request.check()?;
        let (names, addresses): (Vec<_>, Vec<_>) =
            request.items.into_iter().map(|(name, field)| (name, field.address())).unzip();

        let response = self
            .exchange(|reference| S7Message::Request {
                reference,
                parameter: Parameter::ReadVar(addresses),
                payload: Payload::None,
            })
            .await?;
        decode_read(names, &response)
    }

    async fn write(&self, request: WriteRequest<S7Field>) -> Result<WriteResponse> {
        request.check()?;
        let mut names = Vec::with_capacity(request.items.len());
        let mut addresses = Vec::with_capacity(request.items.len());
        let mut values = Vec::with_capacity(request.items.len());
        for (name, field, data) in request.items {
            if data.len() != field.byte_len() {
                let reason = format!("{} needs {} bytes, got {}", name, field.byte_len(), data.len());
                return Err(Error::InvalidRequest(reason));
            }
            names.push(name);
            addresses.push(field.address());
            values.push(DataItem { code: ReturnCode::Ok, data });
        }

        let response = self
            .exchange(|reference| S7Message::Request {
                reference,
                parameter: Parameter::WriteVar(addresses),
                payload: Payload::Data(values),
            })
            .await?;
        decode_write(names, &response)
    }

    async fn subscribe(&self, request: SubscribeRequest<EventType>) -> Result<Subscription> {
        request.check()?;
        let events = request.items.iter().fold(0u8, |mask, (_, event)| mask | event.mask());

        let response = self
            .exchange(|reference| S7Message::UserData {
                reference,
                parameter: Parameter::CpuFunction {
                    method: 0x11,
                    function_group: CPU_FUNCTIONS,
                    subfunction: SUBFUNCTION_MSG_SERVICE,
                    sequence: 0,
                },
                payload: Payload::Subscribe { events },
            })
            .await?;
        check_subscribed(&response)?;

        let id = self.router.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut names = Vec::with_capacity(request.items.len());
        for (name, event) in request.items {
            self.router.add(event, id, name.clone(), tx.clone());
            names.push(name);
        }
        tracing::debug!(subscription = id, events, "subscribed to S7 events");

        Ok(Subscription { handle: SubscriptionHandle { id, names }, events: rx })
    }

    /// Stops routing the subscription's events. The PLC is not told.
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<UnsubscribeResponse> {
        let removed = self.router.remove(handle.id);
        if removed.is_empty() {
            return Err(Error::UnknownSubscription(handle.id));
        }
        let items = removed.into_iter().map(|(_, name)| (name, ResponseCode::Ok)).collect();
        Ok(StatusResponse { items })
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.conversation.subscribe_state()
    }

    async fn close(&self) -> Result<()> {
        self.conversation.close().await?;
        Ok(())
    }
}
