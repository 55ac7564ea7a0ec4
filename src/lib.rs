#![doc = include_str!("../README.md")]

pub mod ack;
pub mod bits;
pub mod io;
pub mod msg;
pub mod packet;
pub mod reliable;
pub mod rtt;
pub mod seq;
pub mod seq_buf;
pub mod sim;
pub mod transport;

pub use {
    io::{Clock, DatagramSocket, RecvWorker, SystemClock},
    msg::{BlobCodec, PayloadCodec, Registry},
    sim::{NetworkSimulator, SimulatorConfig},
    transport::{RecvError, SendError, Transport, TransportConfig},
};
