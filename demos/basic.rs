// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example exercising every access path on a loopback device.
//!
//! Run with: `cargo run --example basic`

use adma_rust::{ControlRequest, ControlResponse, Device, DeviceConfig, Direction};
use std::thread;
use std::time::Duration;

fn main() {
    println!("ADMA Basic Example");
    println!("==================\n");

    let config = DeviceConfig::default()
        .with_event_timeout(Duration::from_millis(500))
        .with_ring_timeout(Duration::from_millis(500));
    let (device, _hw) = match Device::loopback(config) {
        Ok(pair) => pair,
        Err(e) => {
            println!("  Failed to attach loopback device: {}", e);
            return;
        }
    };
    println!("Attached {:?}\n", device);

    // Register window example
    println!("Testing user BAR...");
    match device.open("user") {
        Ok(user) => {
            let _ = user.write(&0xCAFE_F00Du32.to_le_bytes(), 0x10);
            let mut reg = [0u8; 4];
            match user.read(&mut reg, 0x10) {
                Ok(_) => println!("  reg[0x10] = {:#010x}", u32::from_le_bytes(reg)),
                Err(e) => println!("  Read failed: {}", e),
            }
            match user.read(&mut reg, 64 * 1024) {
                Ok(_) => println!("  Out-of-range read unexpectedly succeeded"),
                Err(e) => println!("  Out-of-range read rejected: {}", e),
            }
        }
        Err(e) => println!("  Open failed: {}", e),
    }
    println!();

    // DMA example
    println!("Testing DMA round trip...");
    let (h2c, c2h) = match (device.open("h2c_0"), device.open("c2h_0")) {
        (Ok(h2c), Ok(c2h)) => (h2c, c2h),
        (Err(e), _) | (_, Err(e)) => {
            println!("  Open failed: {}", e);
            return;
        }
    };
    let _ = h2c.control(ControlRequest::PerfStart);
    let src: Vec<u8> = (0..64 * 1024).map(|i| (i & 0xFF) as u8).collect();
    match h2c.write(&src, 0) {
        Ok(n) => println!("  H2C wrote {} bytes", n),
        Err(e) => println!("  H2C failed: {}", e),
    }
    let mut dst = vec![0u8; src.len()];
    match c2h.read(&mut dst, 0) {
        Ok(n) => println!("  C2H read {} bytes, data matches: {}", n, src == dst),
        Err(e) => println!("  C2H failed: {}", e),
    }
    if let Ok(ControlResponse::Perf(perf)) = h2c.control(ControlRequest::PerfGet) {
        println!(
            "  h2c_0: {} bytes in {} transfers over {:?}",
            perf.bytes, perf.transfers, perf.elapsed
        );
    }
    println!();

    // Streaming example
    println!("Testing C2H streaming...");
    match device.open("c2h_1") {
        Ok(stream) => {
            for chunk in [&b"stream "[..], &b"of "[..], &b"bytes"[..]] {
                if let Err(e) = device.stream_completion(1, chunk) {
                    println!("  Append failed: {}", e);
                }
            }
            let mut out = [0u8; 32];
            match stream.read(&mut out, 0) {
                Ok(n) => println!("  Read {:?}", String::from_utf8_lossy(&out[..n])),
                Err(e) => println!("  Stream read failed: {}", e),
            }
            match stream.read(&mut out, 0) {
                Ok(n) => println!("  Read {} more bytes", n),
                Err(e) => println!("  Empty ring: {}", e),
            }
        }
        Err(e) => println!("  Open failed: {}", e),
    }
    println!();

    // Event example
    println!("Testing user event...");
    match device.open("event_2") {
        Ok(event) => {
            let slot = device.event(2);
            let signaller = thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                if let Some(slot) = slot {
                    slot.signal();
                }
            });
            let mut fired = [0u8; 1];
            match event.read(&mut fired, 0) {
                Ok(_) => println!("  event_2 fired: {}", fired[0] == 1),
                Err(e) => println!("  Event read failed: {}", e),
            }
            let _ = signaller.join();
        }
        Err(e) => println!("  Open failed: {}", e),
    }
    println!();

    if let Some(engine) = device.engine(Direction::H2C, 0) {
        println!("Final state of {}: {:?}", engine.name(), engine.state());
    }
    println!("Done!");
}
