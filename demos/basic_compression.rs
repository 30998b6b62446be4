//! Simple compression example
//!
//! Builds a CoAP GET /usage request inside IPv6/UDP, compresses it with the
//! sample device contexts and decompresses it again.
//!
//! ```text
//! cargo run --example basic_compression
//! ```

use std::net::Ipv6Addr;

use schc_coap::{
    CoapMessage, CompressionContext, Direction, RuleSet, compress_packet, compute_checksum,
    compute_length, decompress_packet,
};

const URI_PATH: u16 = 11;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let ruleset = RuleSet::from_file(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/samples/coap_device.json"
    ))?;
    println!("Loaded {} device context(s)", ruleset.devices.len());

    let packet = create_sample_packet()?;
    println!("\nPacket size: {} bytes", packet.len());
    println!("Packet:      {}", hex::encode(&packet));

    for device in &ruleset.devices {
        let mut ctx = CompressionContext::for_device(device, Direction::Up);
        let compressed = compress_packet(device, &mut ctx, &packet)?;

        println!("\n=== Device {} ({:?}) ===", device.device_id, device.mode);
        println!(
            "Rule ID:           {}/{}",
            compressed.rule_id, compressed.rule_id_length
        );
        if let Some(layered) = compressed.layered {
            println!(
                "Layer rules:       IPv6 {}, UDP {}, CoAP {}",
                layered.network, layered.transport, layered.application
            );
        }
        println!(
            "Header:            {} -> {} bits ({:.1} bytes saved)",
            compressed.stats.original_header_bits,
            compressed.stats.compressed_header_bits,
            compressed.stats.savings_bytes()
        );
        println!("Compressed:        {}", hex::encode(&compressed.data));

        let decompressed = decompress_packet(device, &ctx, &compressed.data)?;
        let verdict = if decompressed.data == packet { "identical" } else { "DIFFERS" };
        println!("Decompressed:      {} bytes, {verdict}", decompressed.data.len());
    }

    Ok(())
}

/// 2001:db8::1 port 5683 -> 2001:db8::2 port 5683, CON GET /usage
fn create_sample_packet() -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut coap = CoapMessage::new();
    coap.set_message_type(0);
    coap.set_code(0x01);
    coap.set_message_id(0x0001);
    coap.set_token(vec![0x21, 0xFA, 0x01, 0xFB])?;
    coap.add_option(URI_PATH, b"usage".to_vec());
    coap.set_payload(vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x2A]);

    let src: Ipv6Addr = "2001:db8::1".parse()?;
    let dst: Ipv6Addr = "2001:db8::2".parse()?;

    let mut packet = vec![
        0x60, 0x00, 0x00, 0x00, // Version 6, TC 0, flow label 0
        0x00, 0x00, // Payload length (computed)
        0x11, // Next header UDP
        0x40, // Hop limit 64
    ];
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    packet.extend_from_slice(&[
        0x16, 0x33, // Src port 5683
        0x16, 0x33, // Dst port 5683
        0x00, 0x00, // Length (computed)
        0x00, 0x00, // Checksum (computed)
    ]);
    packet.extend_from_slice(&coap.to_bytes());

    compute_length(&mut packet)?;
    compute_checksum(&mut packet)?;
    Ok(packet)
}
