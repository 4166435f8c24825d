//! A minimal in-process node: reads raw v3 frames off a TCP stream and
//! forges responses, so connection behavior can be tested without a real
//! cluster.

use std::borrow::Cow;
use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use strata_cql::frame::request::query::QueryParameters;
use strata_cql::frame::request::Query;
use strata_cql::frame::{types, SerializedRequest};

pub(crate) const HEADER_SIZE: usize = 8;

pub(crate) const OPCODE_ERROR: u8 = 0x00;
pub(crate) const OPCODE_STARTUP: u8 = 0x01;
pub(crate) const OPCODE_READY: u8 = 0x02;
pub(crate) const OPCODE_OPTIONS: u8 = 0x05;
pub(crate) const OPCODE_SUPPORTED: u8 = 0x06;
pub(crate) const OPCODE_QUERY: u8 = 0x07;
pub(crate) const OPCODE_RESULT: u8 = 0x08;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) async fn bind_node() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[derive(Debug)]
pub(crate) struct RequestFrame {
    pub(crate) opcode: u8,
    pub(crate) flags: u8,
    pub(crate) stream: i8,
    pub(crate) body: Vec<u8>,
}

pub(crate) async fn read_request_frame(stream: &mut TcpStream) -> std::io::Result<RequestFrame> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    assert_eq!(
        header[0] & 0x80,
        0,
        "client frames must not carry the response direction bit"
    );
    assert_eq!(header[0] & 0x7F, 0x03, "client must speak protocol v3");

    let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut body = vec![0; length];
    stream.read_exact(&mut body).await?;

    Ok(RequestFrame {
        opcode: header[3],
        flags: header[1],
        stream: header[2] as i8,
        body,
    })
}

pub(crate) async fn write_response_frame(
    stream: &mut TcpStream,
    opcode: u8,
    stream_id: i8,
    body: &[u8],
) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.push(0x83);
    frame.push(0);
    frame.push(stream_id as u8);
    frame.push(opcode);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    stream.write_all(&frame).await?;
    stream.flush().await
}

pub(crate) fn forged_supported_body() -> Vec<u8> {
    let mut options = HashMap::new();
    options.insert(
        "CQL_VERSION".to_string(),
        vec!["3.0.0".to_string(), "3.4.5".to_string()],
    );
    options.insert(
        "COMPRESSION".to_string(),
        vec!["lz4".to_string(), "snappy".to_string()],
    );
    let mut body = Vec::new();
    types::write_string_multimap(&options, &mut body).unwrap();
    body
}

pub(crate) fn forged_error_body(code: i32, reason: &str) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(code, &mut body);
    types::write_string(reason, &mut body).unwrap();
    body
}

pub(crate) fn forged_result_void_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0001, &mut body);
    body
}

pub(crate) fn forged_result_set_keyspace_body(keyspace: &str) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0003, &mut body);
    types::write_string(keyspace, &mut body).unwrap();
    body
}

pub(crate) fn forged_result_prepared_body(id: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0004, &mut body);
    types::write_short_bytes(id, &mut body).unwrap();
    body
}

/// Serves the OPTIONS/SUPPORTED and STARTUP/READY exchange.
pub(crate) async fn serve_handshake(stream: &mut TcpStream) -> std::io::Result<()> {
    let options = read_request_frame(stream).await?;
    assert_eq!(options.opcode, OPCODE_OPTIONS);
    write_response_frame(stream, OPCODE_SUPPORTED, options.stream, &forged_supported_body())
        .await?;

    let startup = read_request_frame(stream).await?;
    assert_eq!(startup.opcode, OPCODE_STARTUP);
    let startup_options = types::read_string_map(&mut &startup.body[..]).unwrap();
    assert_eq!(startup_options.get("CQL_VERSION").unwrap(), "3.0.0");
    write_response_frame(stream, OPCODE_READY, startup.stream, &[]).await
}

pub(crate) fn make_query(statement: &str) -> SerializedRequest {
    let query = Query {
        contents: Cow::Owned(statement.to_string()),
        parameters: QueryParameters::default(),
    };
    SerializedRequest::make(&query, None).unwrap()
}
