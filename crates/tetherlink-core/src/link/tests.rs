//! 链路管理器测试
//!
//! 平台事件直接通过 `handle_event` 驱动；涉及共享回调的用例启动事件循环。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::manager::{LinkDeps, LinkPolicy};
use super::*;
use crate::ble::mock::{MockTransport, TransportCall};
use crate::ble::{BondState, COMMAND_CHAR_UUID, PeerAddress, ScanMode, TransportEvent};
use crate::crypto::CredentialCipher;
use crate::hotspot::{
    CapabilityResolution, HotspotController, HotspotCredentials, TetherError, TetheringCallback,
    TetheringCapability, TransportKind,
};
use crate::store::{MemoryStore, PersistedRecord, RecordStore};
use crate::telemetry::{BatterySource, TelemetrySampler};

const SERVICE: &str = "c3b9b9e9-be4e-4abf-9200-770f88b59977";
const PIN: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

struct NoBattery;

impl BatterySource for NoBattery {
    fn read_percent(&self) -> Option<i32> {
        None
    }
}

struct FakeTether {
    active: AtomicBool,
    succeed: bool,
    starts: AtomicUsize,
}

#[async_trait]
impl TetheringCapability for FakeTether {
    async fn tethered_interfaces(&self) -> anyhow::Result<Vec<String>> {
        Ok(if self.active.load(Ordering::SeqCst) {
            vec!["wlan0".to_string()]
        } else {
            Vec::new()
        })
    }

    fn start_tethering(
        &self,
        _kind: TransportKind,
        _exclusive: bool,
        callback: Arc<dyn TetheringCallback>,
    ) -> Result<(), TetherError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            self.active.store(true, Ordering::SeqCst);
            callback.on_tethering_started();
        } else {
            callback.on_tethering_failed();
        }
        Ok(())
    }

    async fn stop_tethering(&self, _kind: TransportKind) -> Result<(), TetherError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    manager: Arc<LinkManager>,
    transport: Arc<MockTransport>,
    store: RecordStore,
    cipher: Arc<CredentialCipher>,
    tether: Arc<FakeTether>,
    sampler: TelemetrySampler,
}

fn harness_with(policy: LinkPolicy, tether_succeeds: bool) -> Harness {
    let transport = Arc::new(MockTransport::new());
    let store = RecordStore::new(Arc::new(MemoryStore::new()));
    let cipher = Arc::new(CredentialCipher::new());
    let tether = Arc::new(FakeTether {
        active: AtomicBool::new(false),
        succeed: tether_succeeds,
        starts: AtomicUsize::new(0),
    });
    let hotspot = Arc::new(HotspotController::new(CapabilityResolution::Supported(
        tether.clone(),
    )));

    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
    let sampler = TelemetrySampler::new(
        Arc::new(telemetry_tx),
        Arc::new(NoBattery),
        Duration::from_secs(300),
    );

    let manager = Arc::new(LinkManager::new(
        LinkDeps {
            transport: transport.clone(),
            cipher: cipher.clone(),
            store: store.clone(),
            hotspot,
            sampler: sampler.clone(),
            telemetry: telemetry_rx,
        },
        policy,
    ));

    Harness {
        manager,
        transport,
        store,
        cipher,
        tether,
        sampler,
    }
}

fn harness() -> Harness {
    harness_with(LinkPolicy::default(), true)
}

fn peer() -> PeerAddress {
    PeerAddress::new("AA:BB:CC:DD:EE:FF")
}

fn command(json: &str) -> TransportEvent {
    TransportEvent::Message {
        peer: peer(),
        characteristic: COMMAND_CHAR_UUID,
        payload: json.as_bytes().to_vec(),
    }
}

/// 配对并走完 扫描命中 → 连接 → 绑定
async fn bond(h: &Harness) -> tokio::sync::oneshot::Receiver<PeerAddress> {
    let token = h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;
    h.manager.handle_event(TransportEvent::Connected(peer())).await;
    h.manager
        .handle_event(TransportEvent::BondStateChanged {
            peer: peer(),
            state: BondState::Bonded,
        })
        .await;
    token
}

async fn wait_for_status(rx: &mut mpsc::UnboundedReceiver<ConnectStatus>, want: ConnectStatus) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(status) = rx.recv().await {
            if status == want {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("status never became {want:?}"));
}

fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(v) = rx.try_recv() {
        out.push(v);
    }
    out
}

#[test]
fn test_uuid_format() {
    assert!(validate_uuid_format(SERVICE));
    assert!(validate_uuid_format("AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE"));
    assert!(!validate_uuid_format("c3b9b9e9be4e4abf9200770f88b59977"));
    assert!(!validate_uuid_format("c3b9b9e9-be4e-4abf-9200-770f88b5997"));
    assert!(!validate_uuid_format("g3b9b9e9-be4e-4abf-9200-770f88b59977"));
    assert!(!validate_uuid_format(" c3b9b9e9-be4e-4abf-9200-770f88b59977"));
    assert!(!validate_uuid_format("1234"));
}

#[test]
fn test_qr_payload_parse() {
    let json = format!(r#"{{"serviceUUID":"{SERVICE}","sharedPIN":"{PIN}"}}"#);
    assert_eq!(
        QrPayload::parse(&json).unwrap(),
        (SERVICE.to_string(), PIN.to_string())
    );
    assert_eq!(
        QrPayload::parse(&format!(r#"{{"serviceUUID":"{SERVICE}"}}"#)).unwrap_err(),
        PairError::InvalidFormat
    );
    assert_eq!(QrPayload::parse("not json").unwrap_err(), PairError::InvalidFormat);
}

#[tokio::test]
async fn test_pair_from_qr_persists_and_scans() {
    let h = harness();
    h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();

    let record = h.store.load().await.unwrap();
    assert_eq!(record.service_uuid, SERVICE);
    assert_eq!(record.shared_pin, PIN);
    assert!(h.cipher.is_initialized());
    assert!(h.manager.is_scanning().await);

    let service = Uuid::parse_str(SERVICE).unwrap();
    assert_eq!(
        h.transport.calls(),
        vec![TransportCall::StartScan(service, ScanMode::LowLatency)]
    );
}

#[tokio::test]
async fn test_malformed_pairing_persists_nothing() {
    let h = harness();
    for (uuid, pin) in [
        ("not-a-uuid", PIN),
        (SERVICE, "1234"),
        ("", ""),
        ("c3b9b9e9-be4e-4abf-9200-770f88b59977-00", PIN),
    ] {
        assert_eq!(
            h.manager.pair_from_qr(uuid, pin).await.unwrap_err(),
            PairError::InvalidFormat
        );
    }

    assert_eq!(h.store.load().await.unwrap(), PersistedRecord::default());
    assert!(!h.cipher.is_initialized());
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn test_pair_from_store() {
    let h = harness();
    assert_eq!(
        h.manager.pair_from_store().await.unwrap_err(),
        PairError::MissingCredentials
    );

    h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    let from_qr = h.manager.session().await.unwrap();

    let restored = harness();
    restored
        .store
        .update(|r| {
            r.service_uuid = SERVICE.to_string();
            r.shared_pin = PIN.to_string();
        })
        .await
        .unwrap();
    restored.manager.pair_from_store().await.unwrap();

    assert_eq!(restored.manager.session().await.unwrap(), from_qr);
    assert!(restored.cipher.is_initialized());
    assert!(restored.manager.is_scanning().await);
}

#[tokio::test]
async fn test_scan_failure_reported() {
    let h = harness();
    let mut reports = h.manager.subscribe_reports();
    h.transport.fail_next_scan(ScanFailure::RegistrationFailed);

    h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    assert!(!h.manager.is_scanning().await);
    assert!(drain(&mut reports).contains(&LinkReport::Error(LinkError::ScanFailed(
        ScanFailure::RegistrationFailed
    ))));
}

#[tokio::test]
async fn test_first_match_only() {
    let h = harness();
    h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;
    h.manager
        .handle_event(TransportEvent::ScanMatched(PeerAddress::new("11:22:33:44:55:66")))
        .await;

    assert_eq!(h.transport.count(|c| matches!(c, TransportCall::Connect(_))), 1);
    assert_eq!(h.transport.count(|c| *c == TransportCall::StopScan), 1);
    assert_eq!(h.manager.device_link().await.unwrap().peer, peer());
}

#[tokio::test]
async fn test_retry_bounded() {
    let h = harness();
    let mut reports = h.manager.subscribe_reports();
    h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;

    for attempt in 1..=3u8 {
        h.manager
            .handle_event(TransportEvent::OperationFailed {
                peer: peer(),
                reason: "gatt 133".to_string(),
            })
            .await;
        let link = h.manager.device_link().await.unwrap();
        assert_eq!(link.retry_count, attempt);
        assert!(link.retry_count <= 3);
    }
    assert_eq!(h.transport.count(|c| matches!(c, TransportCall::Connect(_))), 4);

    // 第 4 次失败：放弃，不再重试
    h.manager
        .handle_event(TransportEvent::OperationFailed {
            peer: peer(),
            reason: "gatt 133".to_string(),
        })
        .await;
    assert_eq!(h.transport.count(|c| matches!(c, TransportCall::Connect(_))), 4);
    assert!(h.manager.device_link().await.is_none());
    assert_eq!(h.manager.status(), ConnectStatus::Disconnected);
    assert!(drain(&mut reports).contains(&LinkReport::Error(LinkError::ConnectFailed)));
}

#[tokio::test]
async fn test_retry_limit_is_tunable() {
    let h = harness_with(
        LinkPolicy {
            max_retries: 1,
            auto_reconnect: true,
        },
        true,
    );
    h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;

    for _ in 0..2 {
        h.manager
            .handle_event(TransportEvent::OperationFailed {
                peer: peer(),
                reason: "timeout".to_string(),
            })
            .await;
    }
    assert_eq!(h.transport.count(|c| matches!(c, TransportCall::Connect(_))), 2);
    assert!(h.manager.device_link().await.is_none());
}

#[tokio::test]
async fn test_connect_success_resets_retries_and_bonds() {
    let h = harness();
    h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;
    h.manager
        .handle_event(TransportEvent::OperationFailed {
            peer: peer(),
            reason: "gatt 133".to_string(),
        })
        .await;
    h.manager.handle_event(TransportEvent::Connected(peer())).await;

    let link = h.manager.device_link().await.unwrap();
    assert_eq!(link.retry_count, 0);
    assert_eq!(link.bond_state, BondState::Bonding);
    assert_eq!(h.transport.count(|c| matches!(c, TransportCall::CreateBond(_))), 1);
    assert_eq!(h.manager.status(), ConnectStatus::Disconnected);
}

#[tokio::test]
async fn test_already_bonded_peer_goes_idle() {
    let h = harness();
    h.transport.set_bond_state(BondState::Bonded);
    let mut token = h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;
    h.manager.handle_event(TransportEvent::Connected(peer())).await;

    assert_eq!(h.manager.status(), ConnectStatus::Idle);
    assert_eq!(h.transport.count(|c| matches!(c, TransportCall::CreateBond(_))), 0);
    assert_eq!(token.try_recv().unwrap(), peer());
}

#[tokio::test]
async fn test_bonding_failed() {
    let h = harness();
    let mut reports = h.manager.subscribe_reports();
    h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;
    h.manager.handle_event(TransportEvent::Connected(peer())).await;
    h.manager
        .handle_event(TransportEvent::BondStateChanged {
            peer: peer(),
            state: BondState::Bonding,
        })
        .await;
    assert!(h.manager.device_link().await.is_some());

    h.manager
        .handle_event(TransportEvent::BondStateChanged {
            peer: peer(),
            state: BondState::NotBonded,
        })
        .await;

    assert!(h.manager.device_link().await.is_none());
    assert_eq!(h.manager.status(), ConnectStatus::Disconnected);
    assert!(drain(&mut reports).contains(&LinkReport::Error(LinkError::BondingFailed)));
}

#[tokio::test]
async fn test_first_connect_fires_once() {
    let h = harness();
    let mut reports = h.manager.subscribe_reports();
    let mut token = bond(&h).await;

    assert_eq!(h.manager.status(), ConnectStatus::Idle);
    assert_eq!(token.try_recv().unwrap(), peer());

    // 链路丢失后自动重新扫描并重连
    h.manager.handle_event(TransportEvent::Disconnected(peer())).await;
    assert_eq!(h.manager.status(), ConnectStatus::Disconnected);
    assert!(h.manager.is_scanning().await);

    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;
    h.manager.handle_event(TransportEvent::Connected(peer())).await;
    h.manager
        .handle_event(TransportEvent::BondStateChanged {
            peer: peer(),
            state: BondState::Bonded,
        })
        .await;
    assert_eq!(h.manager.status(), ConnectStatus::Idle);

    let bonded: Vec<bool> = drain(&mut reports)
        .into_iter()
        .filter_map(|r| match r {
            LinkReport::Bonded { first_connect, .. } => Some(first_connect),
            _ => None,
        })
        .collect();
    assert_eq!(bonded, vec![true, false]);
}

#[tokio::test]
async fn test_no_auto_reconnect() {
    let h = harness_with(
        LinkPolicy {
            max_retries: 3,
            auto_reconnect: false,
        },
        true,
    );
    bond(&h).await;
    h.transport.clear_calls();

    h.manager.handle_event(TransportEvent::Disconnected(peer())).await;
    assert!(!h.manager.is_scanning().await);
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn test_hotspot_status_transitions() {
    let h = harness();
    let mut status = h.manager.subscribe_status();
    bond(&h).await;

    h.manager.handle_event(command(r#"{"type":"enableHotspot"}"#)).await;
    assert_eq!(h.manager.status(), ConnectStatus::Connecting);
    assert_eq!(h.tether.starts.load(Ordering::SeqCst), 1);

    h.manager.handle_event(command(r#"{"type":"hotspotJoined"}"#)).await;
    assert_eq!(h.manager.status(), ConnectStatus::Connected);

    h.manager.handle_event(command(r#"{"type":"hotspotLeft"}"#)).await;
    assert_eq!(h.manager.status(), ConnectStatus::Idle);

    let seen = drain(&mut status);
    assert_eq!(
        seen,
        vec![
            ConnectStatus::Disconnected,
            ConnectStatus::Idle,
            ConnectStatus::Connecting,
            ConnectStatus::Connected,
            ConnectStatus::Idle,
        ]
    );
}

#[tokio::test]
async fn test_enable_hotspot_when_already_active() {
    let h = harness();
    h.tether.active.store(true, Ordering::SeqCst);
    bond(&h).await;

    h.manager.handle_event(command(r#"{"type":"enableHotspot"}"#)).await;
    assert_eq!(h.manager.status(), ConnectStatus::Connecting);
    assert_eq!(h.tether.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tethering_failure_returns_to_idle() {
    let h = harness_with(LinkPolicy::default(), false);
    let cancel = CancellationToken::new();
    let runner = {
        let manager = h.manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };

    let mut status = h.manager.subscribe_status();
    bond(&h).await;
    h.manager.handle_event(command(r#"{"type":"enableHotspot"}"#)).await;

    wait_for_status(&mut status, ConnectStatus::Connecting).await;
    wait_for_status(&mut status, ConnectStatus::Idle).await;

    cancel.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_commands_before_bonding_ignored() {
    let h = harness();
    h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;
    h.manager.handle_event(command(r#"{"type":"enableHotspot"}"#)).await;

    assert_eq!(h.tether.starts.load(Ordering::SeqCst), 0);
    assert_eq!(h.manager.status(), ConnectStatus::Disconnected);
}

#[tokio::test]
async fn test_send_credentials_deferred_then_resent() {
    let h = harness();
    let creds = HotspotCredentials::new("Home", "longpassword1").unwrap();
    h.store
        .update(|r| {
            r.ssid = creds.ssid.clone();
            r.password = creds.password.clone();
        })
        .await
        .unwrap();

    // 配对但未连上
    h.manager.pair_from_qr(SERVICE, PIN).await.unwrap();
    assert_eq!(
        h.manager.send_credentials(&creds).await.unwrap_err(),
        LinkError::HotspotShareFailed
    );
    assert!(h.transport.writes_to(crate::ble::CREDENTIALS_CHAR_UUID).is_empty());

    // 首连令牌存在时由首连流程负责发送
    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;
    h.manager.handle_event(TransportEvent::Connected(peer())).await;
    h.manager
        .handle_event(TransportEvent::BondStateChanged {
            peer: peer(),
            state: BondState::Bonded,
        })
        .await;
    assert!(h.transport.writes_to(crate::ble::CREDENTIALS_CHAR_UUID).is_empty());

    // 断线期间保存，重连后自动重发
    h.manager.handle_event(TransportEvent::Disconnected(peer())).await;
    assert!(h.manager.send_credentials(&creds).await.is_err());
    h.manager.handle_event(TransportEvent::ScanMatched(peer())).await;
    h.manager.handle_event(TransportEvent::Connected(peer())).await;
    h.manager
        .handle_event(TransportEvent::BondStateChanged {
            peer: peer(),
            state: BondState::Bonded,
        })
        .await;

    let writes = h.transport.writes_to(crate::ble::CREDENTIALS_CHAR_UUID);
    assert_eq!(writes.len(), 1);
    let desktop = CredentialCipher::new();
    desktop.initialize(PIN);
    assert_eq!(
        crate::ble::gatt::GattCodec::decode_credentials(&writes[0], &desktop).unwrap(),
        creds
    );
}

#[tokio::test]
async fn test_unpair_clears_everything() {
    let h = harness();
    bond(&h).await;
    h.store
        .update(|r| r.ssid = "Home".to_string())
        .await
        .unwrap();

    h.manager.unpair().await.unwrap();

    assert_eq!(h.manager.status(), ConnectStatus::Disconnected);
    assert!(!h.cipher.is_initialized());
    assert!(h.manager.session().await.is_none());
    let record = h.store.load().await.unwrap();
    assert!(!record.has_pairing());
    assert_eq!(record.ssid, "Home");
    assert_eq!(h.transport.count(|c| matches!(c, TransportCall::Disconnect(_))), 1);

    // 断开确认后不再扫描
    h.transport.clear_calls();
    h.manager.handle_event(TransportEvent::Disconnected(peer())).await;
    assert!(h.transport.calls().is_empty());
    assert!(h.manager.device_link().await.is_none());
}

#[tokio::test]
async fn test_repair_while_linked_rescans_after_disconnect() {
    let h = harness();
    bond(&h).await;
    h.transport.clear_calls();

    let other = "0f0f0f0f-1111-2222-3333-444444444444";
    h.manager.pair_from_qr(other, PIN).await.unwrap();
    assert_eq!(h.manager.status(), ConnectStatus::Disconnected);
    assert_eq!(h.transport.count(|c| matches!(c, TransportCall::Disconnect(_))), 1);
    assert!(!h.manager.is_scanning().await);

    h.manager.handle_event(TransportEvent::Disconnected(peer())).await;
    let service = Uuid::parse_str(other).unwrap();
    assert!(
        h.transport
            .calls()
            .contains(&TransportCall::StartScan(service, ScanMode::LowLatency))
    );
}

#[tokio::test]
async fn test_telemetry_forwarded_when_linked() {
    let h = harness();
    let cancel = CancellationToken::new();
    let runner = {
        let manager = h.manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    };
    let mut reports = h.manager.subscribe_reports();

    bond(&h).await;
    h.manager
        .handle_event(command(r#"{"type":"seePhoneInfo","enabled":true}"#))
        .await;
    assert!(drain(&mut reports).contains(&LinkReport::PhoneInfo { enabled: true }));

    // 触发一次信号变化，经事件循环写到 TELEMETRY 特征
    assert!(h.sampler.is_enabled());
    h.sampler.on_signal_level(4);

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !h.transport.writes_to(crate::ble::TELEMETRY_CHAR_UUID).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let writes = h.transport.writes_to(crate::ble::TELEMETRY_CHAR_UUID);
    assert_eq!(
        String::from_utf8(writes[0].clone()).unwrap(),
        r#"{"signalLevel":3,"networkType":"","batteryPercent":-1}"#
    );

    cancel.cancel();
    runner.await.unwrap();
}
