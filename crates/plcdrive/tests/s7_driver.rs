//! S7 driver against a simulated PLC.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use plcrpc::Channel;
use plcrpc::ConnectionState;
use plcrpc::MemoryChannel;

use plcdrive::ControllerType;
use plcdrive::Driver;
use plcdrive::Error;
use plcdrive::ReadRequest;
use plcdrive::ResponseCode;
use plcdrive::S7Config;
use plcdrive::S7Driver;
use plcdrive::SubscribeRequest;
use plcdrive::WriteRequest;
use plcdrive::s7::DataType;
use plcdrive::s7::EventType;
use plcdrive::s7::S7Field;
use plcdrive::s7::Tpkt;
use plcdrive::s7::message::CotpParameter;
use plcdrive::s7::message::DataItem;
use plcdrive::s7::message::Parameter;
use plcdrive::s7::message::Payload;
use plcdrive::s7::message::ReturnCode;
use plcdrive::s7::message::S7Message;
use plcdrive::s7::message::SUBFUNCTION_MSG_SERVICE;
use plcdrive::s7::message::SUBFUNCTION_READ_SZL;
use plcdrive::s7::message::SzlItem;
use plcdrive::s7::message::TransportSize;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Data block the simulated PLC does not have.
const MISSING_DB: u16 = 99;

#[derive(Clone)]
struct Plc {
    far: Arc<MemoryChannel<Tpkt>>,
    article: &'static str,
    put_get: bool,
    answer_setup: bool,
    szl_reads: Arc<AtomicUsize>,
}

impl Plc {
    fn new(far: MemoryChannel<Tpkt>) -> Self {
        Self {
            far: Arc::new(far),
            article: "6ES7 212-1AE40-0XB0",
            put_get: true,
            answer_setup: true,
            szl_reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn start(&self) {
        let plc = self.clone();
        tokio::spawn(async move {
            while let Ok(Some(packet)) = plc.far.recv().await {
                tracing::debug!(?packet, "plc received");
                if let Some(reply) = plc.answer(packet) {
                    let _ = plc.far.send(reply).await;
                }
            }
        });
    }

    /// Sends an unsolicited packet to the driver.
    async fn push(&self, message: S7Message) {
        let _ = self.far.send(Tpkt::data(0, message)).await;
    }

    fn answer(&self, packet: Tpkt) -> Option<Tpkt> {
        let (tpdu_ref, message) = match packet {
            Tpkt::ConnectionRequest { .. } => {
                let parameters = vec![
                    CotpParameter::CalledTsap(0x0102),
                    CotpParameter::CallingTsap(0x0200),
                    CotpParameter::TpduSize(512),
                ];
                return Some(Tpkt::ConnectionConfirm { parameters });
            }
            Tpkt::Data { tpdu_ref, message } => (tpdu_ref, message),
            Tpkt::ConnectionConfirm { .. } => return None,
        };

        let reference = message.reference();
        let ok = |parameter, payload| S7Message::Response { reference, error_class: 0, error_code: 0, parameter, payload };
        let reply = match (message.parameter(), message.payload()) {
            (Parameter::SetupCommunication { .. }, _) if !self.answer_setup => return None,
            (Parameter::SetupCommunication { .. }, _) => ok(
                Parameter::SetupCommunication { max_amq_caller: 3, max_amq_callee: 3, pdu_length: 480 },
                Payload::None,
            ),
            (Parameter::CpuFunction { subfunction, .. }, _) if *subfunction == SUBFUNCTION_READ_SZL => {
                self.szl_reads.fetch_add(1, Ordering::SeqCst);
                let items = vec![
                    SzlItem { index: 0x0006, article_number: "6ES7 000-0000".into() },
                    SzlItem { index: 0x0001, article_number: self.article.into() },
                ];
                S7Message::UserData { reference, parameter: message.parameter().clone(), payload: Payload::SzlResponse { items } }
            }
            (Parameter::CpuFunction { subfunction, .. }, Payload::Subscribe { .. })
                if *subfunction == SUBFUNCTION_MSG_SERVICE =>
            {
                S7Message::UserData {
                    reference,
                    parameter: message.parameter().clone(),
                    payload: Payload::SubscribeResult { code: ReturnCode::Ok },
                }
            }
            (Parameter::ReadVar(_) | Parameter::WriteVar(_), _) if !self.put_get => S7Message::Response {
                reference,
                error_class: 0x81,
                error_code: 0x04,
                parameter: Parameter::None,
                payload: Payload::None,
            },
            (Parameter::ReadVar(addresses), _) => {
                let items = addresses
                    .iter()
                    .map(|address| {
                        if address.db_number == MISSING_DB {
                            return DataItem { code: ReturnCode::NotFound, data: vec![] };
                        }
                        let unit = match address.transport_size {
                            TransportSize::Bit | TransportSize::Byte | TransportSize::Char => 1,
                            TransportSize::Word | TransportSize::Int => 2,
                            TransportSize::DWord | TransportSize::DInt | TransportSize::Real => 4,
                            TransportSize::LReal => 8,
                        };
                        let len = unit * usize::from(address.elements);
                        DataItem { code: ReturnCode::Ok, data: vec![address.byte_offset as u8; len] }
                    })
                    .collect::<Vec<_>>();
                ok(Parameter::VarResponse { items: items.len() as u8 }, Payload::Data(items))
            }
            (Parameter::WriteVar(addresses), _) => {
                let codes = addresses
                    .iter()
                    .map(|address| if address.db_number == MISSING_DB { ReturnCode::NotFound } else { ReturnCode::Ok })
                    .collect::<Vec<_>>();
                ok(Parameter::VarResponse { items: codes.len() as u8 }, Payload::Status(codes))
            }
            _ => return None,
        };
        Some(Tpkt::data(tpdu_ref, reply))
    }
}

async fn connect(plc: &Plc, near: MemoryChannel<Tpkt>, config: S7Config) -> plcdrive::Result<S7Driver> {
    plc.start();
    S7Driver::connect(Arc::new(near), config).await
}

#[tokio::test]
async fn test_handshake_negotiates_and_identifies() -> anyhow::Result<()> {
    init_tracing();
    let (near, far) = MemoryChannel::pair();
    let plc = Plc::new(far);
    let driver = connect(&plc, near, S7Config::default()).await?;

    let negotiated = driver.negotiated();
    assert_eq!(negotiated.calling_tsap, 0x0200);
    assert_eq!(negotiated.tpdu_size, 512);
    assert_eq!(negotiated.pdu_size, 480);
    assert_eq!(negotiated.max_amq_callee, 3);
    assert_eq!(negotiated.controller_type, ControllerType::S7_1200);
    assert_eq!(plc.szl_reads.load(Ordering::SeqCst), 1);

    assert_eq!(driver.conversation().transactions().concurrency_limit(), 3);
    assert!(driver.state().borrow().is_connected());
    Ok(())
}

#[tokio::test]
async fn test_known_controller_skips_identification() -> anyhow::Result<()> {
    init_tracing();
    let (near, far) = MemoryChannel::pair();
    let plc = Plc::new(far);
    let config = S7Config::default().with_controller_type(ControllerType::S7_1500);
    let driver = connect(&plc, near, config).await?;

    assert_eq!(driver.negotiated().controller_type, ControllerType::S7_1500);
    assert_eq!(plc.szl_reads.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_passive_mode_connects_without_traffic() -> anyhow::Result<()> {
    init_tracing();
    let (near, far) = MemoryChannel::pair();
    let plc = Plc::new(far);
    let driver = connect(&plc, near, S7Config::default().with_passive(true)).await?;

    assert_eq!(driver.negotiated().calling_tsap, 0x0100);
    assert!(driver.state().borrow().is_connected());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_setup_fails_the_handshake() {
    init_tracing();
    let (near, far) = MemoryChannel::pair();
    let mut plc = Plc::new(far);
    plc.answer_setup = false;
    let config = S7Config::default().with_request_timeout(Duration::from_secs(2));

    let Err(Error::Rpc(plcrpc::Error::Handshake { step, source })) = connect(&plc, near, config).await else {
        panic!("handshake should fail");
    };
    assert_eq!(step, "SetupCommunication");
    assert!(source.is_timeout());
    assert_eq!(plc.szl_reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_read_reports_per_item_codes() -> anyhow::Result<()> {
    init_tracing();
    let (near, far) = MemoryChannel::pair();
    let plc = Plc::new(far);
    let driver = connect(&plc, near, S7Config::default()).await?;

    let request = ReadRequest::new()
        .add("speed", S7Field::db(1, 4, DataType::Int))
        .add("limits", S7Field::db(1, 8, DataType::Real).with_elements(2))
        .add("ghost", S7Field::db(MISSING_DB, 0, DataType::Word));
    let response = driver.read(request).await?;

    assert_eq!(response.value("speed"), Some(&[4, 4][..]));
    assert_eq!(response.value("limits").map(<[u8]>::len), Some(8));
    let ghost = response.get("ghost").unwrap();
    assert_eq!(ghost.code, ResponseCode::NotFound);
    assert_eq!(ghost.value, None);
    Ok(())
}

#[tokio::test]
async fn test_disabled_put_get_denies_every_item() -> anyhow::Result<()> {
    init_tracing();
    let (near, far) = MemoryChannel::pair();
    let mut plc = Plc::new(far);
    plc.put_get = false;
    let driver = connect(&plc, near, S7Config::default()).await?;

    let request = ReadRequest::new()
        .add("a", S7Field::db(1, 0, DataType::Byte))
        .add("b", S7Field::db(2, 0, DataType::Byte));
    let response = driver.read(request).await?;

    assert!(response.items.iter().all(|item| item.code == ResponseCode::AccessDenied));
    Ok(())
}

#[tokio::test]
async fn test_write_checks_sizes_and_reports_codes() -> anyhow::Result<()> {
    init_tracing();
    let (near, far) = MemoryChannel::pair();
    let plc = Plc::new(far);
    let driver = connect(&plc, near, S7Config::default()).await?;

    let request = WriteRequest::new()
        .add("speed", S7Field::db(1, 4, DataType::Int), vec![0x01, 0x2c])
        .add("ghost", S7Field::db(MISSING_DB, 0, DataType::Byte), vec![1]);
    let response = driver.write(request).await?;
    assert_eq!(response.code("speed"), Some(ResponseCode::Ok));
    assert_eq!(response.code("ghost"), Some(ResponseCode::NotFound));

    let short = WriteRequest::new().add("speed", S7Field::db(1, 4, DataType::Int), vec![0x01]);
    assert!(matches!(driver.write(short).await, Err(Error::InvalidRequest(_))));
    assert!(matches!(driver.read(ReadRequest::new()).await, Err(Error::InvalidRequest(_))));
    Ok(())
}

#[tokio::test]
async fn test_pushed_events_reach_subscribers() -> anyhow::Result<()> {
    init_tracing();
    let (near, far) = MemoryChannel::pair();
    let plc = Plc::new(far);
    let driver = connect(&plc, near, S7Config::default()).await?;

    let request = SubscribeRequest::new().add("mode", EventType::Mode).add("alarms", EventType::Alarm);
    let mut subscription = driver.subscribe(request).await?;

    plc.push(S7Message::UserData {
        reference: 0,
        parameter: Parameter::ModeTransition { current_mode: 0x08 },
        payload: Payload::None,
    })
    .await;
    plc.push(S7Message::UserData {
        reference: 0,
        parameter: Parameter::None,
        payload: Payload::Push { event: EventType::Alarm, data: vec![0xAA, 0x01] },
    })
    .await;

    let mode = subscription.events.recv().await.unwrap();
    assert_eq!((mode.name.as_str(), mode.value.as_slice()), ("mode", &[0x08][..]));
    let alarm = subscription.events.recv().await.unwrap();
    assert_eq!((alarm.name.as_str(), alarm.value.as_slice()), ("alarms", &[0xAA, 0x01][..]));

    let response = driver.unsubscribe(&subscription.handle).await?;
    assert!(response.all_ok());
    assert_eq!(response.items.len(), 2);
    assert!(matches!(
        driver.unsubscribe(&subscription.handle).await,
        Err(Error::UnknownSubscription(id)) if id == subscription.handle.id
    ));
    Ok(())
}

#[tokio::test]
async fn test_close_disconnects() -> anyhow::Result<()> {
    init_tracing();
    let (near, far) = MemoryChannel::pair();
    let plc = Plc::new(far);
    let driver = connect(&plc, near, S7Config::default()).await?;

    driver.close().await?;

    assert!(matches!(*driver.state().borrow(), ConnectionState::Disconnected));
    let read = driver.read(ReadRequest::new().add("a", S7Field::db(1, 0, DataType::Byte))).await;
    assert!(read.is_err());
    Ok(())
}
