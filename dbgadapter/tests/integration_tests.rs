/// Integration tests for the debug client
///
/// The primary connection is a scripted mock: every byte the client writes is
/// checked against the script, and replies can be split into arbitrary reads.
/// Tests that need the target to react, or to stay silent, use an in-memory
/// duplex pipe instead.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use dbgadapter::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_test::io::{Builder, Mock};

const PID: i32 = 81;

fn test_config() -> ClientConfig {
    ClientConfig {
        debug_bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        debug_port: 0,
        poll_interval_ms: 10,
        ext_fw_timeout_ms: 200,
        ..ClientConfig::default()
    }
}

fn packet(command: Command, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&PACKET_MAGIC.to_le_bytes());
    out.extend_from_slice(&command.code().to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn status(status: Status) -> [u8; 4] {
    status.code().to_le_bytes()
}

fn attach_packet() -> Vec<u8> {
    packet(Command::DebugAttach, &PID.to_le_bytes())
}

fn detach_packet() -> Vec<u8> {
    packet(Command::DebugDetach, &[])
}

/// Script that attaches, runs `body`, then detaches
fn attached_script(body: impl FnOnce(&mut Builder)) -> Mock {
    let mut builder = Builder::new();
    builder.write(&attach_packet()).read(&status(Status::Success));
    body(&mut builder);
    builder.write(&detach_packet()).read(&status(Status::Success));
    builder.build()
}

fn client(mock: Mock) -> DebugClient<Mock> {
    DebugClient::from_transport(mock, test_config())
}

async fn attach(client: &DebugClient<Mock>) {
    let (handler, _rx) = channel_handler();
    client.attach(PID, handler).await.unwrap();
}

#[test]
fn test_client_creation() {
    let client: DebugClient = DebugClient::new(ClientConfig::default());
    assert_eq!(client.session_state(), SessionState::Detached);
    assert!(!client.is_attached());
    assert_eq!(client.attached_pid(), None);
}

#[tokio::test]
async fn test_operations_require_connection() {
    let client: DebugClient<Mock> = DebugClient::new(test_config());
    assert!(!client.is_connected().await);

    let (handler, _rx) = channel_handler();
    assert!(matches!(client.attach(PID, handler).await, Err(DebugError::NotConnected)));
    assert!(matches!(client.single_step().await, Err(DebugError::NotConnected)));
    assert!(matches!(client.kernel_base().await, Err(DebugError::NotConnected)));
    assert_eq!(client.session_state(), SessionState::Detached);
}

#[tokio::test]
async fn test_attached_operations_require_session() {
    let client = client(Builder::new().build());

    assert!(matches!(client.single_step().await, Err(DebugError::NotAttached)));
    assert!(matches!(client.process_stop().await, Err(DebugError::NotAttached)));
    assert!(matches!(client.list_threads().await, Err(DebugError::NotAttached)));
    assert!(matches!(client.get_registers(1).await, Err(DebugError::NotAttached)));
    assert!(matches!(client.detach().await, Err(DebugError::NotAttached)));
}

#[tokio::test]
async fn test_attach_twice_fails() {
    let client = client(attached_script(|_| {}));

    attach(&client).await;
    assert!(client.is_attached());
    assert_eq!(client.attached_pid(), Some(PID));
    assert!(client.listener_addr().is_some());

    let (handler, _rx) = channel_handler();
    assert!(matches!(
        client.attach(PID, handler).await,
        Err(DebugError::AlreadyAttached)
    ));
    assert!(client.is_attached());

    client.detach().await.unwrap();
    assert_eq!(client.session_state(), SessionState::Detached);
    assert!(client.listener_addr().is_none());
}

#[tokio::test]
async fn test_rejected_attach_returns_to_detached() {
    let mock = Builder::new()
        .write(&attach_packet())
        .read(&status(Status::AlreadyDebugging))
        .write(&attach_packet())
        .read(&status(Status::Success))
        .write(&detach_packet())
        .read(&status(Status::Success))
        .build();
    let client = client(mock);

    let (handler, _rx) = channel_handler();
    let err = client.attach(PID, handler).await.unwrap_err();
    assert!(matches!(err, DebugError::RemoteRejected(Status::AlreadyDebugging)));
    assert_eq!(client.session_state(), SessionState::Detached);
    assert!(!client.is_listening());

    attach(&client).await;
    client.detach().await.unwrap();
}

#[tokio::test]
async fn test_detach_forces_detached_on_rejection() {
    let mock = Builder::new()
        .write(&attach_packet())
        .read(&status(Status::Success))
        .write(&detach_packet())
        .read(&status(Status::Error))
        .build();
    let client = client(mock);

    attach(&client).await;
    let err = client.detach().await.unwrap_err();
    assert!(matches!(err, DebugError::RemoteRejected(Status::Error)));
    assert_eq!(client.session_state(), SessionState::Detached);
    assert_eq!(client.attached_pid(), None);
}

#[tokio::test]
async fn test_breakpoint_index_validation() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&((MAX_BREAKPOINTS - 1) as i32).to_le_bytes());
    payload.extend_from_slice(&1i32.to_le_bytes());
    payload.extend_from_slice(&0x0040_1000u64.to_le_bytes());

    let client = client(attached_script(|b| {
        b.write(&packet(Command::DebugBreakpoint, &payload))
            .read(&status(Status::Success));
    }));
    attach(&client).await;

    let err = client
        .set_breakpoint(MAX_BREAKPOINTS, true, 0x0040_1000)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DebugError::IndexOutOfRange { kind: "breakpoint", index: 10, max: 10 }
    ));

    client
        .set_breakpoint(MAX_BREAKPOINTS - 1, true, 0x0040_1000)
        .await
        .unwrap();

    client.detach().await.unwrap();
}

#[tokio::test]
async fn test_disabled_breakpoint_still_sends_address() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&2i32.to_le_bytes());
    payload.extend_from_slice(&0i32.to_le_bytes());
    payload.extend_from_slice(&0xFFFF_0000u64.to_le_bytes());

    let client = client(attached_script(|b| {
        b.write(&packet(Command::DebugBreakpoint, &payload))
            .read(&status(Status::Success));
    }));
    attach(&client).await;
    client.set_breakpoint(2, false, 0xFFFF_0000).await.unwrap();
    client.detach().await.unwrap();
}

#[tokio::test]
async fn test_watchpoint_payload_and_validation() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&3i32.to_le_bytes());
    payload.extend_from_slice(&1i32.to_le_bytes());
    payload.extend_from_slice(&(WatchLength::Byte8 as u32).to_le_bytes());
    payload.extend_from_slice(&(BreakType::ReadWrite as u32).to_le_bytes());
    payload.extend_from_slice(&0x7000_0010u64.to_le_bytes());
    assert_eq!(payload.len(), WATCHPOINT_PACKET_SIZE);

    let client = client(attached_script(|b| {
        b.write(&packet(Command::DebugWatchpoint, &payload))
            .read(&status(Status::Success));
    }));
    attach(&client).await;

    let err = client
        .set_watchpoint(MAX_WATCHPOINTS, true, WatchLength::Byte4, BreakType::Write, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DebugError::IndexOutOfRange { kind: "watchpoint", .. }));

    client
        .set_watchpoint(3, true, WatchLength::Byte8, BreakType::ReadWrite, 0x7000_0010)
        .await
        .unwrap();

    client.detach().await.unwrap();
}

#[tokio::test]
async fn test_list_threads() {
    let mut ids = Vec::new();
    for id in [10u32, 11, 12] {
        ids.extend_from_slice(&id.to_le_bytes());
    }

    let client = client(attached_script(|b| {
        b.write(&packet(Command::DebugThreads, &[]))
            .read(&status(Status::Success))
            .read(&3u32.to_le_bytes())
            .read(&ids);
    }));
    attach(&client).await;

    assert_eq!(client.list_threads().await.unwrap(), vec![10, 11, 12]);

    client.detach().await.unwrap();
}

#[tokio::test]
async fn test_thread_info() {
    let info = ThreadInfo {
        pid: PID,
        priority: 256,
        name: "SceGnmDriver".into(),
    };
    let encoded = info.encode();

    let client = client(attached_script(|b| {
        b.write(&packet(Command::DebugThreadInfo, &100_050u32.to_le_bytes()))
            .read(&status(Status::Success))
            .read(&encoded[..12])
            .read(&encoded[12..]);
    }));
    attach(&client).await;

    assert_eq!(client.thread_info(100_050).await.unwrap(), info);

    client.detach().await.unwrap();
}

#[tokio::test]
async fn test_register_round_trip_phases() {
    let regs = Registers {
        rip: 0x0000_0008_0000_1234,
        rsp: 0x0000_7FFF_FFFF_0000,
        rflags: 0x202,
        ..Registers::default()
    };
    let encoded = regs.encode();

    let mut set_header = Vec::new();
    set_header.extend_from_slice(&5u32.to_le_bytes());
    set_header.extend_from_slice(&(Registers::SIZE as u32).to_le_bytes());

    let client = client(attached_script(|b| {
        b.write(&packet(Command::DebugGetRegisters, &5u32.to_le_bytes()))
            .read(&status(Status::Success))
            .read(&encoded[..100])
            .read(&encoded[100..])
            .write(&packet(Command::DebugSetRegisters, &set_header))
            .read(&status(Status::Success))
            .write(&encoded)
            .read(&status(Status::Success));
    }));
    attach(&client).await;

    let fetched = client.get_registers(5).await.unwrap();
    assert_eq!(fetched, regs);
    client.set_registers(5, &fetched).await.unwrap();

    client.detach().await.unwrap();
}

#[tokio::test]
async fn test_set_debug_registers_rejected_after_data() {
    let dbregs = DebugRegisters {
        dr: [0x1000, 0, 0, 0, 0, 0, 0, 0x1, 0, 0, 0, 0, 0, 0, 0, 0],
    };

    let mut set_header = Vec::new();
    set_header.extend_from_slice(&9u32.to_le_bytes());
    set_header.extend_from_slice(&(DebugRegisters::SIZE as u32).to_le_bytes());

    let client = client(attached_script(|b| {
        b.write(&packet(Command::DebugSetDebugRegisters, &set_header))
            .read(&status(Status::Success))
            .write(&dbregs.encode())
            .read(&status(Status::DataNull));
    }));
    attach(&client).await;

    let err = client.set_debug_registers(9, &dbregs).await.unwrap_err();
    assert!(matches!(err, DebugError::RemoteRejected(Status::DataNull)));
    assert!(client.is_attached());

    client.detach().await.unwrap();
}

#[tokio::test]
async fn test_fp_registers_fetch() {
    let mut fp = FpRegisters::default();
    fp.env.mxcsr = 0x1F80;
    fp.xmm[3] = [0xAB; 16];

    let client = client(attached_script(|b| {
        b.write(&packet(Command::DebugGetFpRegisters, &7u32.to_le_bytes()))
            .read(&status(Status::Success))
            .read(&fp.encode());
    }));
    attach(&client).await;

    assert_eq!(client.get_fp_registers(7).await.unwrap(), fp);

    client.detach().await.unwrap();
}

#[tokio::test]
async fn test_process_control_sub_codes() {
    let client = client(attached_script(|b| {
        for code in [1i32, 0, 2] {
            b.write(&packet(Command::DebugStopGo, &code.to_le_bytes()))
                .read(&status(Status::Success));
        }
        b.write(&packet(Command::DebugSingleStep, &[]))
            .read(&status(Status::Success))
            .write(&packet(Command::DebugStopThread, &4u32.to_le_bytes()))
            .read(&status(Status::Success))
            .write(&packet(Command::DebugResumeThread, &4u32.to_le_bytes()))
            .read(&status(Status::Success));
    }));
    attach(&client).await;

    client.process_stop().await.unwrap();
    client.process_resume().await.unwrap();
    client.process_kill().await.unwrap();
    client.single_step().await.unwrap();
    client.stop_thread(4).await.unwrap();
    client.resume_thread(4).await.unwrap();

    client.detach().await.unwrap();
}

#[tokio::test]
async fn test_ext_process_control_is_best_effort() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&1234u32.to_le_bytes());
    payload.push(2);

    let mock = Builder::new()
        .write(&packet(Command::DebugExtStopGo, &payload))
        .read(&status(Status::Error))
        .build();
    let client = client(mock);

    // Rejected by the target, but nothing surfaces
    client.process_ext_kill(1234).await;

    let disconnected: DebugClient<Mock> = DebugClient::new(test_config());
    disconnected.process_ext_stop(1234).await;
}

#[tokio::test]
async fn test_ext_fw_version_against_closed_target() {
    let mock = Builder::new().write(&packet(Command::ExtFwVersion, &[])).build();
    let client = client(mock);

    assert_eq!(client.ext_fw_version().await, 0);
}

#[tokio::test]
async fn test_ext_fw_version_is_cached() {
    let mock = Builder::new()
        .write(&packet(Command::ExtFwVersion, &[]))
        .read(&0x0505u16.to_le_bytes())
        .build();
    let client = client(mock);

    assert_eq!(client.ext_fw_version().await, 0x0505);
    assert_eq!(client.ext_fw_version().await, 0x0505);
}

#[tokio::test]
async fn test_console_and_kernel_commands() {
    let mut print_data = b"hello".to_vec();
    print_data.push(0);

    let mut notify_header = Vec::new();
    notify_header.extend_from_slice(&222i32.to_le_bytes());
    notify_header.extend_from_slice(&3u32.to_le_bytes());

    let mut read_header = Vec::new();
    read_header.extend_from_slice(&0xFFFF_FFFF_8000_0000u64.to_le_bytes());
    read_header.extend_from_slice(&4u32.to_le_bytes());

    let mock = Builder::new()
        .write(&packet(Command::Version, &[]))
        .read(&4u32.to_le_bytes())
        .read(b"1.3\0")
        .write(&packet(Command::ConsolePrint, &6u32.to_le_bytes()))
        .write(&print_data)
        .read(&status(Status::Success))
        .write(&packet(Command::ConsoleNotify, &notify_header))
        .write(b"hi\0")
        .read(&status(Status::Success))
        .write(&packet(Command::KernelBase, &[]))
        .read(&status(Status::Success))
        .read(&0xFFFF_FFFF_8220_0000u64.to_le_bytes())
        .write(&packet(Command::KernelRead, &read_header))
        .read(&status(Status::Success))
        .read(&[0xDE, 0xAD, 0xBE, 0xEF])
        .build();
    let client = client(mock);

    assert_eq!(client.debugger_version().await.unwrap(), "1.3");
    client.print("hello").await.unwrap();
    client.notify(222, "hi").await.unwrap();
    assert_eq!(client.kernel_base().await.unwrap(), 0xFFFF_FFFF_8220_0000);
    assert_eq!(
        client.kernel_read(0xFFFF_FFFF_8000_0000, 4).await.unwrap(),
        vec![0xDE, 0xAD, 0xBE, 0xEF]
    );
}

#[tokio::test]
async fn test_disconnect_detaches_first() {
    let mock = Builder::new()
        .write(&attach_packet())
        .read(&status(Status::Success))
        .write(&detach_packet())
        .read(&status(Status::Success))
        .write(&packet(Command::ConsoleEnd, &[]))
        .build();
    let client = client(mock);

    attach(&client).await;
    client.disconnect().await.unwrap();

    assert!(!client.is_connected().await);
    assert_eq!(client.session_state(), SessionState::Detached);
    assert!(matches!(client.single_step().await, Err(DebugError::NotConnected)));
}

#[tokio::test]
async fn test_interrupt_delivered_during_session() {
    let client = client(attached_script(|_| {}));

    let mut events = client.attach_with_channel(PID).await.unwrap();
    let address = client.listener_addr().unwrap();

    let event = InterruptEvent {
        lwpid: 100_321,
        status: 0x57F,
        thread_name: "SceMain".into(),
        registers: Registers {
            rip: 0x0040_2000,
            ..Registers::default()
        },
        ..InterruptEvent::default()
    };
    let mut target = TcpStream::connect(address).await.unwrap();
    target.write_all(&event.encode()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, event);

    client.detach().await.unwrap();
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn test_shared_client_serializes_commands() {
    let mock = Builder::new()
        .write(&packet(Command::KernelBase, &[]))
        .read(&status(Status::Success))
        .read(&1u64.to_le_bytes())
        .write(&packet(Command::KernelBase, &[]))
        .read(&status(Status::Success))
        .read(&1u64.to_le_bytes())
        .build();
    let client = Arc::new(client(mock));

    let a = tokio::spawn({
        let client = client.clone();
        async move { client.kernel_base().await.unwrap() }
    });
    let b = tokio::spawn({
        let client = client.clone();
        async move { client.kernel_base().await.unwrap() }
    });

    assert_eq!(a.await.unwrap(), 1);
    assert_eq!(b.await.unwrap(), 1);
}

#[tokio::test]
async fn test_listener_accepts_before_attach_reply() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let config = ClientConfig {
        debug_port: port,
        ..test_config()
    };
    let listener_addr = config.listener_address();

    let event = InterruptEvent {
        lwpid: 100_500,
        status: 0x57F,
        thread_name: "SceEarly".into(),
        ..InterruptEvent::default()
    };
    let expected = event.clone();

    let (transport, mut agent) = tokio::io::duplex(4096);
    let target = tokio::spawn(async move {
        let mut request = vec![0u8; COMMAND_HEADER_SIZE + ATTACH_PACKET_SIZE];
        agent.read_exact(&mut request).await.unwrap();
        assert_eq!(request, attach_packet());

        // Dial back and trap before the attach is acknowledged
        let mut dial = TcpStream::connect(listener_addr).await.unwrap();
        dial.write_all(&event.encode()).await.unwrap();
        agent.write_all(&status(Status::Success)).await.unwrap();

        let mut request = vec![0u8; COMMAND_HEADER_SIZE];
        agent.read_exact(&mut request).await.unwrap();
        assert_eq!(request, detach_packet());
        agent.write_all(&status(Status::Success)).await.unwrap();
        (agent, dial)
    });

    let client = DebugClient::from_transport(transport, config);
    let mut events = client.attach_with_channel(PID).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, expected);

    client.detach().await.unwrap();
    target.await.unwrap();
}

#[tokio::test]
async fn test_cancelled_fw_query_restores_read_timeout() {
    let (transport, _silent_target) = tokio::io::duplex(4096);
    let config = ClientConfig {
        read_timeout_ms: Some(50),
        ext_fw_timeout_ms: 60_000,
        ..test_config()
    };
    let client = DebugClient::from_transport(transport, config);

    let abandoned = tokio::time::timeout(Duration::from_millis(100), client.ext_fw_version()).await;
    assert!(abandoned.is_err());

    let outcome = tokio::time::timeout(Duration::from_secs(2), client.kernel_base())
        .await
        .expect("configured read timeout no longer in effect");
    assert!(matches!(
        outcome,
        Err(DebugError::TransferIncomplete { expected: 4, received: 0 })
    ));
}

#[tokio::test]
async fn test_huge_thread_count_then_close() {
    let mock = Builder::new()
        .write(&attach_packet())
        .read(&status(Status::Success))
        .write(&packet(Command::DebugThreads, &[]))
        .read(&status(Status::Success))
        .read(&u32::MAX.to_le_bytes())
        .build();
    let client = client(mock);
    attach(&client).await;

    let err = client.list_threads().await.unwrap_err();
    assert!(matches!(
        err,
        DebugError::TransferIncomplete { expected: 0x3_FFFF_FFFC, received: 0 }
    ));
}

#[tokio::test]
async fn test_reboot_resets_session_and_connection() {
    let mock = Builder::new()
        .write(&attach_packet())
        .read(&status(Status::Success))
        .write(&packet(Command::ConsoleReboot, &[]))
        .build();
    let client = client(mock);
    attach(&client).await;

    client.reboot().await.unwrap();

    assert!(!client.is_connected().await);
    assert_eq!(client.session_state(), SessionState::Detached);
    assert_eq!(client.attached_pid(), None);
    assert!(client.listener_addr().is_none());
    assert!(matches!(client.kernel_base().await, Err(DebugError::NotConnected)));
}

#[tokio::test]
async fn test_kernel_write_and_console_info() {
    let data = [0x90u8, 0x90, 0xC3];
    let mut header = Vec::new();
    header.extend_from_slice(&0xFFFF_FFFF_8240_0000u64.to_le_bytes());
    header.extend_from_slice(&(data.len() as u32).to_le_bytes());

    let mock = Builder::new()
        .write(&packet(Command::KernelWrite, &header))
        .read(&status(Status::Success))
        .write(&data)
        .read(&status(Status::Success))
        .write(&packet(Command::ConsoleInfo, &[]))
        .read(&status(Status::Success))
        .build();
    let client = client(mock);

    client.kernel_write(0xFFFF_FFFF_8240_0000, &data).await.unwrap();
    client.console_info().await.unwrap();
}

#[tokio::test]
async fn test_kernel_write_rejected_after_data() {
    let mut header = Vec::new();
    header.extend_from_slice(&0x1000u64.to_le_bytes());
    header.extend_from_slice(&2u32.to_le_bytes());

    let mock = Builder::new()
        .write(&packet(Command::KernelWrite, &header))
        .read(&status(Status::Success))
        .write(&[1, 2])
        .read(&status(Status::Error))
        .build();
    let client = client(mock);

    let err = client.kernel_write(0x1000, &[1, 2]).await.unwrap_err();
    assert!(matches!(err, DebugError::RemoteRejected(Status::Error)));
}

#[tokio::test]
async fn test_set_fp_registers_phases() {
    let mut fp = FpRegisters::default();
    fp.env.control_word = 0x037F;
    fp.ymm_high[0] = [0x5A; 16];

    let mut set_header = Vec::new();
    set_header.extend_from_slice(&12u32.to_le_bytes());
    set_header.extend_from_slice(&(FpRegisters::SIZE as u32).to_le_bytes());

    let client = client(attached_script(|b| {
        b.write(&packet(Command::DebugSetFpRegisters, &set_header))
            .read(&status(Status::Success))
            .write(&fp.encode())
            .read(&status(Status::Success));
    }));
    attach(&client).await;

    client.set_fp_registers(12, &fp).await.unwrap();

    client.detach().await.unwrap();
}
