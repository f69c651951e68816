use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::watch;

use plcrpc::Channel;
use plcrpc::ConnectionState;
use plcrpc::Conversation;
use plcrpc::Handshake;
use plcrpc::ResolutionCache;
use plcrpc::Transition;
use plcrpc::handshake;

use crate::ads::field::DirectField;
use crate::ads::field::Field;
use crate::ads::field::Notification;
use crate::ads::field::SymbolicField;
use crate::ads::message::AdsData;
use crate::ads::message::AmsPacket;
use crate::ads::message::MultiRequestItem;
use crate::ads::message::Reader;
use crate::ads::message::SUMUP_READ;
use crate::ads::message::SUMUP_WRITE;
use crate::ads::resolver::SymbolResolver;
use crate::ads::session::Session;
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
use crate::config::AdsConfig;
use crate::error::Error;
use crate::error::Result;
use crate::subscription::Router;
use crate::subscription::Subscription;
use crate::subscription::SubscriptionHandle;

/// ADS has no connection setup of its own; the AMS route exists or it doesn't.
#[derive(Debug, Clone, Copy)]
enum AdsStep {
    Connect,
}

struct AdsHandshake;

#[async_trait::async_trait]
impl Handshake<AmsPacket> for AdsHandshake {
    type Step = AdsStep;
    type Outcome = ();

    fn first_step(&self) -> AdsStep {
        AdsStep::Connect
    }

    async fn step(&self, _: &AdsStep, _: &Conversation<AmsPacket>) -> plcrpc::Result<Transition<AdsStep, ()>> {
        Ok(Transition::Done(()))
    }
}

/// A connected Beckhoff ADS device.
pub struct AdsDriver {
    session: Arc<Session>,
    symbols: ResolutionCache<SymbolicField, DirectField>,
    router: Arc<Router<u32>>,
}

impl AdsDriver {
    pub async fn connect(channel: Arc<dyn Channel<AmsPacket>>, config: AdsConfig) -> Result<Self> {
        let conversation = Conversation::new("ads", channel, config.conversation());
        let router = Arc::new(Router::new());

        let notifications = router.clone();
        conversation.on_unsolicited(move |packet| route_notification(&notifications, packet));

        handshake::run(&AdsHandshake, &conversation).await?;
        tracing::info!(ams_target = %config.target, ams_source = %config.source, "ADS connection established");

        let session = Arc::new(Session::new(conversation, config));
        let symbols = ResolutionCache::new(Arc::new(SymbolResolver::new(session.clone())));
        Ok(Self { session, symbols, router })
    }

    pub fn conversation(&self) -> &Conversation<AmsPacket> {
        self.session.conversation()
    }

    /// The resolved form of a symbolic field, if it has been looked up.
    pub fn resolved(&self, field: &SymbolicField) -> Option<DirectField> {
        self.symbols.lookup(field)
    }

    /// Resolves the symbolic fields among `fields`, keeping their order.
    async fn direct(&self, fields: Vec<Field>) -> Result<Vec<DirectField>> {
        let symbolic: Vec<SymbolicField> = fields
            .iter()
            .filter_map(|field| match field {
                Field::Symbolic(symbol) => Some(symbol.clone()),
                Field::Direct(_) => None,
            })
            .collect();

        let mut resolved: HashMap<SymbolicField, DirectField> = HashMap::new();
        if !symbolic.is_empty() {
            let values = self.symbols.resolve_all(&symbolic).await?;
            resolved.extend(symbolic.into_iter().zip(values));
        }

        fields
            .into_iter()
            .map(|field| match field {
                Field::Direct(direct) => Ok(direct),
                Field::Symbolic(symbol) => resolved
                    .get(&symbol)
                    .copied()
                    .ok_or_else(|| Error::from(plcrpc::Error::resolution(&symbol.name, "missing from resolution"))),
            })
            .collect()
    }

    async fn single_read(&self, name: String, field: DirectField) -> Result<ReadResponse> {
        let request = AdsData::ReadRequest {
            index_group: field.index_group,
            index_offset: field.index_offset,
            length: field.byte_len(),
        };
        let AdsData::ReadResponse { result, data } = self.session.exchange(request).await? else {
            return Err(Error::malformed("expected a read response"));
        };
        let code = ResponseCode::from(result);
        let value = code.is_ok().then_some(data);
        Ok(ReadResponse { items: vec![ReadItem { name, code, value }] })
    }

    async fn sum_read(&self, names: Vec<String>, fields: Vec<DirectField>) -> Result<ReadResponse> {
        let items = fields
            .iter()
            .map(|field| MultiRequestItem::Read {
                index_group: field.index_group,
                index_offset: field.index_offset,
                length: field.byte_len(),
            })
            .collect();
        let read_length = fields
            .iter()
            .try_fold(0u32, |total, field| total.checked_add(4)?.checked_add(field.byte_len()))
            .ok_or_else(|| Error::InvalidRequest("sum read response would exceed 4 GiB".into()))?;
        let request = AdsData::ReadWriteRequest {
            index_group: SUMUP_READ,
            index_offset: item_count(fields.len())?,
            read_length,
            items,
            data: Vec::new(),
        };

        let data = sum_response(self.session.exchange(request).await?)?;

        // Every item's return code comes first, then every item's data.
        let mut reader = Reader::new(&data);
        let mut codes = Vec::with_capacity(fields.len());
        for _ in &fields {
            codes.push(reader.return_code().ok_or_else(|| Error::malformed("truncated sum read codes"))?);
        }

        let mut items = Vec::with_capacity(fields.len());
        for ((name, field), code) in names.into_iter().zip(&fields).zip(codes) {
            let bytes = reader
                .take(field.byte_len() as usize)
                .ok_or_else(|| Error::malformed(format!("truncated sum read data for {}", name)))?;
            let code = ResponseCode::from(code);
            let value = code.is_ok().then(|| bytes.to_vec());
            items.push(ReadItem { name, code, value });
        }
        Ok(ReadResponse { items })
    }

    async fn single_write(&self, name: String, field: DirectField, data: Vec<u8>) -> Result<WriteResponse> {
        let request =
            AdsData::WriteRequest { index_group: field.index_group, index_offset: field.index_offset, data };
        let AdsData::WriteResponse { result } = self.session.exchange(request).await? else {
            return Err(Error::malformed("expected a write response"));
        };
        Ok(StatusResponse { items: vec![(name, ResponseCode::from(result))] })
    }

    async fn sum_write(&self, names: Vec<String>, fields: Vec<DirectField>, data: Vec<u8>) -> Result<WriteResponse> {
        let items = fields
            .iter()
            .map(|field| MultiRequestItem::Write {
                index_group: field.index_group,
                index_offset: field.index_offset,
                length: field.byte_len(),
            })
            .collect();
        let count = item_count(fields.len())?;
        let request = AdsData::ReadWriteRequest {
            index_group: SUMUP_WRITE,
            index_offset: count,
            read_length: count.checked_mul(4).ok_or_else(|| Error::InvalidRequest("too many items".into()))?,
            items,
            data,
        };

        let data = sum_response(self.session.exchange(request).await?)?;
        let mut reader = Reader::new(&data);
        let mut items = Vec::with_capacity(names.len());
        for name in names {
            let code = reader.return_code().ok_or_else(|| Error::malformed("truncated sum write codes"))?;
            items.push((name, ResponseCode::from(code)));
        }
        Ok(StatusResponse { items })
    }

    async fn add_notification(&self, field: DirectField, notification: &Notification) -> Result<u32> {
        let request = AdsData::AddNotificationRequest {
            index_group: field.index_group,
            index_offset: field.index_offset,
            length: field.byte_len(),
            transmission_mode: notification.mode.transmission_mode(),
            max_delay: 0,
            cycle_time: notification.mode.cycle_time(),
        };
        match self.session.exchange(request).await? {
            AdsData::AddNotificationResponse { result, handle } if result.is_ok() => Ok(handle),
            AdsData::AddNotificationResponse { result, .. } => {
                Err(plcrpc::Error::protocol(result.code(), format!("adding notification failed: {}", result)).into())
            }
            _ => Err(Error::malformed("expected an add notification response")),
        }
    }

    async fn delete_notification(&self, handle: u32) -> Result<ResponseCode> {
        match self.session.exchange(AdsData::DeleteNotificationRequest { handle }).await? {
            AdsData::DeleteNotificationResponse { result } => {
                if !result.is_ok() {
                    tracing::debug!(handle, %result, "deleting notification failed");
                }
                Ok(ResponseCode::from(result))
            }
            _ => Err(Error::malformed("expected a delete notification response")),
        }
    }
}

/// The payload of a sum-up response whose overall result is OK.
fn sum_response(data: AdsData) -> Result<Vec<u8>> {
    match data {
        AdsData::ReadWriteResponse { result, data } if result.is_ok() => Ok(data),
        AdsData::ReadWriteResponse { result, .. } => {
            Err(plcrpc::Error::protocol(result.code(), format!("sum request rejected: {}", result)).into())
        }
        _ => Err(Error::malformed("expected a read/write response")),
    }
}

/// Sum-up requests carry their item count in a `u32`.
fn item_count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidRequest(format!("{} items do not fit one sum request", len)))
}

fn check_length(name: &str, field: &DirectField, data: &[u8]) -> Result<()> {
    if data.len() != field.byte_len() as usize {
        let reason = format!("{} needs {} bytes, got {}", name, field.byte_len(), data.len());
        return Err(Error::InvalidRequest(reason));
    }
    Ok(())
}

/// Hands device notifications to the subscriptions that own their handles.
fn route_notification(router: &Router<u32>, packet: AmsPacket) {
    let AdsData::DeviceNotification { stamps } = packet.data else {
        tracing::debug!(invoke_id = packet.invoke_id, "ignoring unsolicited ADS packet");
        return;
    };
    for stamp in stamps {
        let time = stamp.time();
        for sample in stamp.samples {
            if router.deliver(&sample.handle, time, &sample.data) == 0 {
                tracing::trace!(handle = sample.handle, "notification for unknown handle");
            }
        }
    }
}

#[async_trait::async_trait]
impl Driver for AdsDriver {
    type Field = Field;
    type Trigger = Notification;

    /// One field is read with a plain read, several with one sum-up request.
    async fn read(&self, request: ReadRequest<Field>) -> Result<ReadResponse> {
        request.check()?;
        let (names, fields): (Vec<_>, Vec<_>) = request.items.into_iter().unzip();
        let fields = self.direct(fields).await?;

        if let ([name], [field]) = (names.as_slice(), fields.as_slice()) {
            return self.single_read(name.clone(), *field).await;
        }
        self.sum_read(names, fields).await
    }

    async fn write(&self, request: WriteRequest<Field>) -> Result<WriteResponse> {
        request.check()?;
        let mut names = Vec::with_capacity(request.items.len());
        let mut fields = Vec::with_capacity(request.items.len());
        let mut values = Vec::with_capacity(request.items.len());
        for (name, field, value) in request.items {
            names.push(name);
            fields.push(field);
            values.push(value);
        }
        let fields = self.direct(fields).await?;
        for ((name, field), value) in names.iter().zip(&fields).zip(&values) {
            check_length(name, field, value)?;
        }

        if let ([name], [field], [value]) = (names.as_slice(), fields.as_slice(), values.as_slice()) {
            return self.single_write(name.clone(), *field, value.clone()).await;
        }
        self.sum_write(names, fields, values.concat()).await
    }

    /// Adds one device notification per item, all in flight together.
    ///
    /// If any of them fails the ones already added are deleted again.
    async fn subscribe(&self, request: SubscribeRequest<Notification>) -> Result<Subscription> {
        request.check()?;
        let fields = request.items.iter().map(|(_, notification)| notification.field.clone()).collect();
        let fields = self.direct(fields).await?;

        let adds = fields
            .iter()
            .zip(&request.items)
            .map(|(field, (_, notification))| self.add_notification(*field, notification));
        let results = futures::future::join_all(adds).await;

        if let Some(error) = results.iter().find_map(|result| result.as_ref().err().cloned()) {
            for handle in results.into_iter().flatten() {
                if let Err(e) = self.delete_notification(handle).await {
                    tracing::warn!(handle, error = %e, "could not roll back notification");
                }
            }
            return Err(error);
        }

        let id = self.router.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut names = Vec::with_capacity(request.items.len());
        for ((name, _), handle) in request.items.into_iter().zip(results.into_iter().flatten()) {
            tracing::debug!(subscription = id, handle, item = %name, "notification added");
            self.router.add(handle, id, name.clone(), tx.clone());
            names.push(name);
        }

        Ok(Subscription { handle: SubscriptionHandle { id, names }, events: rx })
    }

    /// Deletes the subscription's notifications one after another.
    ///
    /// A delete that gets no usable answer is reported as that item's
    /// `InternalError`; the remaining notifications are still deleted.
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<UnsubscribeResponse> {
        let removed = self.router.remove(handle.id);
        if removed.is_empty() {
            return Err(Error::UnknownSubscription(handle.id));
        }

        let mut items = Vec::with_capacity(removed.len());
        for (notification, name) in removed {
            let code = match self.delete_notification(notification).await {
                Ok(code) => code,
                Err(error) => {
                    tracing::warn!(handle = notification, item = %name, %error, "could not delete notification");
                    ResponseCode::InternalError
                }
            };
            items.push((name, code));
        }
        Ok(StatusResponse { items })
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.session.conversation().subscribe_state()
    }

    async fn close(&self) -> Result<()> {
        self.session.conversation().close().await?;
        Ok(())
    }
}
