// Shared helpers: a fixed test key and a scripted fake adbd on loopback TCP.
#![allow(dead_code)]

use adb_freeze::protocol::{encode, Message, ADB_VERSION};
use adb_freeze::{AdbConfig, AdbConnection, AdbKeyPair, AuthType, Command};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

pub const TEST_KEY_PEM: &str = include_str!("../fixtures/adbkey");
pub const TEST_KEY_PKCS8_DER: &[u8] = include_bytes!("../fixtures/adbkey.der");
pub const TEST_KEY_PUBLIC_DER: &[u8] = include_bytes!("../fixtures/adbkey.pub.der");
pub const TEST_KEY_ADB_FORMAT: &[u8] = include_bytes!("../fixtures/adbkey.adb");
pub const ZERO_TOKEN_SIGNATURE: &[u8] = include_bytes!("../fixtures/zero_token.sig");

pub fn test_keypair() -> Arc<AdbKeyPair> {
    static KEY: OnceLock<Arc<AdbKeyPair>> = OnceLock::new();
    KEY.get_or_init(|| Arc::new(AdbKeyPair::from_pem(TEST_KEY_PEM).unwrap()))
        .clone()
}

/// The device end of a loopback socket
pub struct FakeDevice {
    socket: TcpStream,
}

impl FakeDevice {
    pub fn recv(&mut self) -> Message {
        let message = Message::decode(&mut self.socket).expect("device recv");
        assert!(message.is_valid(), "client sent invalid frame {}", message);
        message
    }

    /// Next frame that is not a flow-control OKAY
    pub fn recv_skip_okay(&mut self) -> Message {
        loop {
            let message = self.recv();
            if message.kind() != Some(Command::Okay) {
                return message;
            }
        }
    }

    pub fn send(&mut self, command: Command, arg0: u32, arg1: u32, payload: &[u8]) {
        self.send_raw(&encode(command, arg0, arg1, payload));
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.socket.write_all(bytes).expect("device send");
    }

    /// CNXN -> AUTH token -> signature -> CNXN
    pub fn handshake(&mut self) {
        let cnxn = self.recv();
        assert_eq!(cnxn.kind(), Some(Command::Cnxn));
        assert_eq!(cnxn.arg0, ADB_VERSION);
        assert_eq!(cnxn.payload, b"host::\0");

        self.send(Command::Auth, AuthType::Token as u32, 0, &[0u8; 20]);

        let auth = self.recv();
        assert_eq!(auth.kind(), Some(Command::Auth));
        assert_eq!(auth.arg0, AuthType::Signature as u32);
        assert_eq!(auth.payload.len(), 256);

        self.send(Command::Cnxn, ADB_VERSION, 4096, b"device::ro.product.name=test;\0");
    }

    /// Expect an OPEN for `destination` and return its local id. Acks and
    /// closes for earlier streams are skipped.
    pub fn expect_open(&mut self, destination: &str) -> u32 {
        let open = loop {
            let message = self.recv_skip_okay();
            if message.kind() != Some(Command::Clse) {
                break message;
            }
        };
        assert_eq!(open.kind(), Some(Command::Open));
        let mut expected = destination.as_bytes().to_vec();
        expected.push(0);
        assert_eq!(open.payload, expected);
        open.arg0
    }

    /// Read until the client hangs up
    pub fn drain(mut self) -> Vec<Message> {
        let mut seen = Vec::new();
        while let Ok(message) = Message::decode(&mut self.socket) {
            seen.push(message);
        }
        seen
    }
}

/// Start a fake adbd running `script` and return the client end.
pub fn spawn_device<T, F>(script: F) -> (TcpStream, JoinHandle<T>)
where
    F: FnOnce(FakeDevice) -> T + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        script(FakeDevice { socket })
    });

    let client = TcpStream::connect(addr).unwrap();
    (client, handle)
}

/// Fake adbd plus an unconnected client
pub fn device_connection<T, F>(config: &AdbConfig, script: F) -> (AdbConnection, JoinHandle<T>)
where
    F: FnOnce(FakeDevice) -> T + Send + 'static,
    T: Send + 'static,
{
    let (socket, handle) = spawn_device(script);
    let connection = AdbConnection::new(socket, test_keypair(), config).unwrap();
    (connection, handle)
}

/// Fake adbd that completes the handshake before running `script`
pub fn connected<T, F>(script: F) -> (AdbConnection, JoinHandle<T>)
where
    F: FnOnce(&mut FakeDevice) -> T + Send + 'static,
    T: Send + 'static,
{
    let (connection, handle) = device_connection(&AdbConfig::default(), move |mut device| {
        device.handshake();
        let result = script(&mut device);
        device.drain();
        result
    });
    connection.connect().unwrap();
    (connection, handle)
}

/// Fake adbd behind a listener, plus a config that dials it
pub fn listening_device<T, F>(script: F) -> (AdbConfig, JoinHandle<T>)
where
    F: FnOnce(FakeDevice) -> T + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        script(FakeDevice { socket })
    });

    let config = AdbConfig {
        port,
        ..AdbConfig::default()
    };
    (config, handle)
}

/// A loopback port with nothing listening on it
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
