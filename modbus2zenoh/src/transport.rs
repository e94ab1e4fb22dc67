//! Register reads over Modbus TCP or RTU.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use crate::config::{ConnectionConfig, Parity};
use crate::definition::RegisterKind;

/// Errors from a single register transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("device returned exception: {0}")]
    Exception(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("expected {expected} word(s), got {actual}")]
    Malformed { expected: usize, actual: usize },
}

/// A field bus that can read a block of registers.
///
/// Coils and discrete inputs come back as one `0`/`1` word per bit.
pub trait RegisterTransport: Send + 'static {
    fn read_registers(
        &mut self,
        address: u16,
        count: u16,
        kind: RegisterKind,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;
}

/// Transport over `tokio-modbus`, connecting lazily.
///
/// The client context is taken out for every read and only put back after
/// a clean response, so a failed or cancelled read forces a reconnect.
pub struct ModbusTransport {
    device: String,
    connection: ConnectionConfig,
    unit_id: u8,
    connect_timeout: Duration,
    context: Option<Context>,
}

impl ModbusTransport {
    pub fn new(
        device: impl Into<String>,
        connection: ConnectionConfig,
        unit_id: u8,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            device: device.into(),
            connection,
            unit_id,
            connect_timeout,
            context: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.context.is_some()
    }

    /// Open a client context. Must not borrow `self`: the context is not `Sync`.
    async fn connect(
        device: String,
        connection: ConnectionConfig,
        unit_id: u8,
        connect_timeout: Duration,
    ) -> Result<Context, TransportError> {
        let slave = Slave(unit_id);

        let ctx = match &connection {
            ConnectionConfig::Tcp { host, port } => {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| TransportError::Connection(format!("resolve {host}: {e}")))?
                    .next()
                    .ok_or_else(|| {
                        TransportError::Connection(format!("no address for {host}"))
                    })?;

                tokio::time::timeout(connect_timeout, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| TransportError::Timeout)?
                    .map_err(|e| TransportError::Connection(e.to_string()))?
            }
            ConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity {
                    Parity::None => tokio_serial::Parity::None,
                    Parity::Even => tokio_serial::Parity::Even,
                    Parity::Odd => tokio_serial::Parity::Odd,
                };
                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };
                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(port.as_str(), *baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits)
                    .timeout(connect_timeout);

                let serial = tokio_serial::SerialStream::open(&builder)
                    .map_err(|e| TransportError::Connection(format!("serial open failed: {e}")))?;

                rtu::attach_slave(serial, slave)
            }
        };

        info!(device = %device, connection = %connection, "Connected");
        Ok(ctx)
    }
}

async fn read_block(
    ctx: &mut Context,
    address: u16,
    count: u16,
    kind: RegisterKind,
) -> Result<Vec<u16>, TransportError> {
    fn bits_to_words(bits: Vec<bool>, count: u16) -> Vec<u16> {
        bits.into_iter()
            .take(usize::from(count))
            .map(u16::from)
            .collect()
    }

    let words = match kind {
        RegisterKind::Holding => ctx
            .read_holding_registers(address, count)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))?,
        RegisterKind::Input => ctx
            .read_input_registers(address, count)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))?,
        RegisterKind::Coil => ctx
            .read_coils(address, count)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .map(|bits| bits_to_words(bits, count))
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))?,
        RegisterKind::Discrete => ctx
            .read_discrete_inputs(address, count)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .map(|bits| bits_to_words(bits, count))
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))?,
    };

    if words.len() != usize::from(count) {
        return Err(TransportError::Malformed {
            expected: usize::from(count),
            actual: words.len(),
        });
    }
    Ok(words)
}

impl RegisterTransport for ModbusTransport {
    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
        kind: RegisterKind,
    ) -> Result<Vec<u16>, TransportError> {
        let mut ctx = match self.context.take() {
            Some(ctx) => ctx,
            None => {
                Self::connect(
                    self.device.clone(),
                    self.connection.clone(),
                    self.unit_id,
                    self.connect_timeout,
                )
                .await?
            }
        };

        let result = read_block(&mut ctx, address, count, kind).await;
        match &result {
            Ok(_) | Err(TransportError::Exception(_)) => self.context = Some(ctx),
            Err(e) => {
                debug!(device = %self.device, error = %e, "Dropping connection after failed read");
            }
        }
        result
    }
}
