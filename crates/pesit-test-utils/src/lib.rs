// pesit-test-utils: a minimal PeSIT client for integration testing.
//
// Drives a server over a framed loopback TCP connection. Only implements
// what the test suites need: the requester side of the connection, file
// selection, open, and transfer phases.

use futures_util::{SinkExt, StreamExt};
use pesit_core::{DiagnosticCode, Fpdu, FpduCodec, FpduKind, ParamValue, pgi, pi};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Default receive timeout; generous enough for CI, short enough to fail fast.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A test-side PeSIT requester speaking to a server under test.
pub struct TestClient {
    framed: Framed<TcpStream, FpduCodec>,
    /// Client-assigned connection id (X); echoed by the server as
    /// `destination` on every response.
    pub connection_id: u16,
    /// Server-assigned connection id (Y); learned from ACONNECT.
    pub server_connection_id: u16,
}

impl TestClient {
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(TestClient {
            framed: Framed::new(stream, FpduCodec::new()),
            connection_id: 0x0A01,
            server_connection_id: 0,
        })
    }

    /// Send any FPDU as-is.
    pub async fn send(&mut self, fpdu: Fpdu) -> Result<(), pesit_core::CodecError> {
        self.framed.send(fpdu).await
    }

    /// Send raw bytes below the codec (for malformed-input tests).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.framed.get_mut().write_all(bytes).await?;
        self.framed.get_mut().flush().await
    }

    /// Receive the next FPDU or fail after the timeout.
    pub async fn recv(&mut self) -> Result<Fpdu, String> {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
            Err(_) => Err("timed out waiting for FPDU".to_owned()),
            Ok(None) => Err("connection closed".to_owned()),
            Ok(Some(Err(e))) => Err(format!("codec: {e}")),
            Ok(Some(Ok(fpdu))) => Ok(fpdu),
        }
    }

    /// Receive and assert the kind, returning the FPDU.
    pub async fn expect(&mut self, kind: FpduKind) -> Fpdu {
        let fpdu = self.recv().await.unwrap_or_else(|e| panic!("expected {kind}: {e}"));
        assert_eq!(fpdu.kind, kind, "expected {kind}, got {}", fpdu.kind);
        fpdu
    }

    /// True when the server closed the transport without another FPDU.
    pub async fn expect_close(&mut self) -> bool {
        matches!(
            tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await,
            Ok(None)
        )
    }

    // -----------------------------------------------------------------------
    // FPDU builders (requester side)
    // -----------------------------------------------------------------------

    pub fn connect_fpdu(&self, partner: &str, server: &str, password: Option<&str>) -> Fpdu {
        let mut params = vec![
            ParamValue::string(pi::REQUESTER_ID, partner),
            ParamValue::string(pi::SERVER_ID, server),
        ];
        if let Some(pw) = password {
            params.push(ParamValue::string(pi::ACCESS_CONTROL, pw));
        }
        params.push(ParamValue::uint(pi::VERSION, u64::from(pesit_core::PROTOCOL_VERSION)));
        params.push(ParamValue::uint(pi::ACCESS_TYPE, 2));
        Fpdu::new(FpduKind::Connect, 0, self.connection_id).with_params(params)
    }

    /// CONNECT with an explicit sync-point interval (KB) and access type.
    pub fn connect_fpdu_with_options(
        &self,
        partner: &str,
        server: &str,
        password: Option<&str>,
        access_type: u8,
        sync_interval_kb: u16,
    ) -> Fpdu {
        let mut fpdu = self.connect_fpdu(partner, server, password);
        fpdu.params
            .retain(|p| p.id() != pi::ACCESS_TYPE);
        fpdu.params.push(ParamValue::uint(pi::ACCESS_TYPE, u64::from(access_type)));
        let mut sync = sync_interval_kb.to_be_bytes().to_vec();
        sync.push(1); // acknowledgement window
        fpdu.params.push(ParamValue::bytes(pi::SYNC_OPTION, sync));
        fpdu
    }

    fn request(&self, kind: FpduKind) -> Fpdu {
        Fpdu::new(kind, self.server_connection_id, self.connection_id)
    }

    pub fn create_fpdu(&self, filename: &str) -> Fpdu {
        self.request(FpduKind::Create).with_params(vec![
            ParamValue::group(
                pgi::FILE_ID,
                vec![ParamValue::string(pi::FILENAME, filename)],
            ),
            ParamValue::uint(pi::FILE_TYPE, 0),
            ParamValue::group(
                pgi::LOGICAL_ATTRS,
                vec![
                    ParamValue::string(pi::RECORD_FORMAT, "V"),
                    ParamValue::uint(pi::RECORD_LENGTH, 0),
                ],
            ),
        ])
    }

    pub fn select_fpdu(&self, filename: &str) -> Fpdu {
        self.request(FpduKind::Select).with_params(vec![ParamValue::group(
            pgi::FILE_ID,
            vec![ParamValue::string(pi::FILENAME, filename)],
        )])
    }

    pub fn open_fpdu(&self) -> Fpdu {
        self.request(FpduKind::Open)
    }

    pub fn write_fpdu(&self) -> Fpdu {
        self.request(FpduKind::Write)
    }

    pub fn read_fpdu(&self) -> Fpdu {
        self.request(FpduKind::Read)
    }

    pub fn dtf_fpdu(&self, payload: &[u8]) -> Fpdu {
        self.request(FpduKind::Dtf).with_payload(payload.to_vec())
    }

    pub fn dtf_end_fpdu(&self) -> Fpdu {
        self.request(FpduKind::DtfEnd)
    }

    pub fn syn_fpdu(&self, number: u32) -> Fpdu {
        self.request(FpduKind::Syn)
            .with_params(vec![ParamValue::uint(pi::SYNC_POINT_NUMBER, u64::from(number))])
    }

    pub fn ack_syn_fpdu(&self, number: u32) -> Fpdu {
        self.request(FpduKind::AckSyn)
            .with_params(vec![ParamValue::uint(pi::SYNC_POINT_NUMBER, u64::from(number))])
    }

    pub fn trans_end_fpdu(&self) -> Fpdu {
        self.request(FpduKind::TransEnd)
    }

    pub fn ack_trans_end_fpdu(&self) -> Fpdu {
        self.request(FpduKind::AckTransEnd)
            .with_params(vec![ParamValue::bytes(
                pi::DIAGNOSTIC,
                DiagnosticCode::SUCCESS.to_bytes(),
            )])
    }

    pub fn close_fpdu(&self) -> Fpdu {
        self.request(FpduKind::Close)
    }

    pub fn deselect_fpdu(&self) -> Fpdu {
        self.request(FpduKind::Deselect)
    }

    pub fn release_fpdu(&self) -> Fpdu {
        self.request(FpduKind::Release)
    }

    pub fn msg_fpdu(&self, content: &str) -> Fpdu {
        self.request(FpduKind::Msg)
            .with_params(vec![ParamValue::string(pi::MESSAGE, content)])
    }

    // -----------------------------------------------------------------------
    // Composite flows
    // -----------------------------------------------------------------------

    /// Run the CONNECT handshake; panics on RCONNECT.
    pub async fn establish(&mut self, partner: &str, server: &str, password: Option<&str>) {
        let connect = self.connect_fpdu(partner, server, password);
        self.send(connect).await.unwrap();
        let aconnect = self.expect(FpduKind::Aconnect).await;
        assert_eq!(aconnect.destination, self.connection_id);
        self.server_connection_id = aconnect.source;
    }

    /// CONNECT expecting refusal; returns the RCONNECT diagnostic.
    pub async fn establish_expect_refusal(
        &mut self,
        partner: &str,
        server: &str,
        password: Option<&str>,
    ) -> DiagnosticCode {
        let connect = self.connect_fpdu(partner, server, password);
        self.send(connect).await.unwrap();
        let rconnect = self.expect(FpduKind::Rconnect).await;
        rconnect.diagnostic().expect("RCONNECT must carry PI_02")
    }

    /// CREATE + OPEN + WRITE; returns the ACK_WRITE restart point.
    pub async fn start_upload(&mut self, filename: &str) -> u64 {
        self.send(self.create_fpdu(filename)).await.unwrap();
        let ack = self.expect(FpduKind::AckCreate).await;
        assert_eq!(ack.diagnostic(), Some(DiagnosticCode::SUCCESS));
        self.send(self.open_fpdu()).await.unwrap();
        self.expect(FpduKind::AckOpen).await;
        self.send(self.write_fpdu()).await.unwrap();
        let ack_write = self.expect(FpduKind::AckWrite).await;
        ack_write.param_uint(pi::RESTART_POINT).unwrap_or(0)
    }

    /// DTF_END + TRANS_END; returns the ACK_TRANS_END FPDU.
    pub async fn finish_upload(&mut self) -> Fpdu {
        self.send(self.dtf_end_fpdu()).await.unwrap();
        self.send(self.trans_end_fpdu()).await.unwrap();
        self.expect(FpduKind::AckTransEnd).await
    }

    /// CLOSE + DESELECT + RELEASE, verifying each acknowledgement.
    pub async fn teardown(&mut self) {
        self.send(self.close_fpdu()).await.unwrap();
        self.expect(FpduKind::AckClose).await;
        self.send(self.deselect_fpdu()).await.unwrap();
        self.expect(FpduKind::AckDeselect).await;
        self.send(self.release_fpdu()).await.unwrap();
        self.expect(FpduKind::Relconf).await;
    }
}
