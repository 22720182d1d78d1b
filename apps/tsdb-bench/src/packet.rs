use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt;

/// Label carried by every stored reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Measurement {
    Raw,
    Mean,
}

impl Measurement {
    pub fn as_str(self) -> &'static str {
        match self {
            Measurement::Raw => "raw",
            Measurement::Mean => "mean",
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub timestamp: DateTime<Utc>,
    pub asset_id: u32,
    pub attribute_id: u32,
    pub measurement: Measurement,
    pub value: f64,
}

/// Builds one synthetic reading per (device, attribute) pair, all stamped with
/// `timestamp`. Ids start at 1; values are uniform in `[0, 100)`.
pub fn generate_packets(
    timestamp: DateTime<Utc>,
    devices: u32,
    attributes_per_device: u32,
) -> Vec<Packet> {
    let mut rng = rand::thread_rng();
    let mut packets = Vec::with_capacity(devices as usize * attributes_per_device as usize);
    for asset_id in 1..=devices {
        for attribute_id in 1..=attributes_per_device {
            packets.push(Packet {
                timestamp,
                asset_id,
                attribute_id,
                measurement: Measurement::Raw,
                value: rng.gen_range(0.0..100.0),
            });
        }
    }
    packets
}
