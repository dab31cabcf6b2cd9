//! Two BACnet devices talking through in-process channels.
//!
//! The "client" reads a large property from the "server". The answer does not
//! fit in one APDU, so it travels as a segmented Complex-ACK.
//!
//! Run with: `RUST_LOG=debug cargo run --example loopback`

use std::time::Duration;

use bacnet_tsm::{
    Address, Apdu, ComplexAck, ConfirmedRequest, Delivery, DeviceInfoTable, Driver, Pdu,
    Segmentation, TransactionManager, TsmConfig,
};
use log::{info, warn};
use tokio::sync::mpsc;

const READ_PROPERTY: u8 = 12;

/// Forward everything one device transmits to the other, from `source`.
fn wire(mut transmit: mpsc::UnboundedReceiver<Apdu>, to: bacnet_tsm::DriverHandle, source: Address) {
    tokio::spawn(async move {
        while let Some(apdu) = transmit.recv().await {
            if to.network_input(Apdu::new(source.clone(), apdu.pdu)).is_err() {
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let client_address = Address::from("192.168.1.10:47808".parse::<std::net::SocketAddr>()?);
    let server_address = Address::from("192.168.1.20:47808".parse::<std::net::SocketAddr>()?);

    let config = TsmConfig::default()
        .with_segmentation(Segmentation::Both)
        .with_max_apdu_length(206)
        .with_segment_timeout(Duration::from_millis(500));

    let client = TransactionManager::new(config.clone(), DeviceInfoTable::new())?;
    let server = TransactionManager::new(config, DeviceInfoTable::new())?;

    let (client_driver, client_handle, client_tx, mut client_rx) = Driver::new(client);
    let (server_driver, server_handle, server_tx, mut server_rx) = Driver::new(server);
    let client_task = tokio::spawn(client_driver.run());
    let server_task = tokio::spawn(server_driver.run());

    wire(client_tx, server_handle.clone(), client_address.clone());
    wire(server_tx, client_handle.clone(), server_address.clone());

    // Server application: answer every read with 1 KiB of data
    let answers = server_handle.clone();
    tokio::spawn(async move {
        while let Some(delivery) = server_rx.recv().await {
            match delivery {
                Delivery::Request(Apdu {
                    peer,
                    pdu: Pdu::ConfirmedRequest(request),
                }) => {
                    let invoke_id = request.invoke_id.unwrap_or_default();
                    info!("Server: request {} from {}", invoke_id, peer);
                    let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
                    let ack = ComplexAck::new(invoke_id, request.service_choice, data);
                    if let Err(e) = answers.answer(Apdu::new(peer, ack)).await {
                        warn!("Server: could not answer: {}", e);
                    }
                }
                other => info!("Server: {:?}", other),
            }
        }
    });

    let request = ConfirmedRequest::new(READ_PROPERTY, vec![0x0c, 0x02, 0x00, 0x00, 0x08, 0x19, 0x4c]);
    let invoke_id = client_handle
        .request(Apdu::new(server_address.clone(), request))
        .await?;
    info!("Client: sent request {:?}", invoke_id);

    match tokio::time::timeout(Duration::from_secs(10), client_rx.recv()).await? {
        Some(Delivery::Response(Apdu {
            pdu: Pdu::ComplexAck(ack),
            ..
        })) => info!("Client: received {} bytes", ack.data.len()),
        other => warn!("Client: unexpected outcome {:?}", other),
    }

    drop(client_handle);
    drop(server_handle);
    client_task.abort();
    server_task.abort();
    Ok(())
}
