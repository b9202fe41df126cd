use rand::{thread_rng, Rng};
use veil_core::packet::{mac_fields, write_transport_header};
use veil_core::{ip, Packet, DATA_MIN_SIZE, HANDSHAKE_INITIATION_SIZE, MSG_HANDSHAKE_INITIATION};

#[test]
fn fuzz_parse_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..2048);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = Packet::parse(&data);
        let _ = mac_fields(&data);
    }
}

#[test]
fn fuzz_typed_lengths_never_panic() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let kind: u32 = rng.gen_range(0..6);
        let len: usize = rng.gen_range(0..200);
        let mut data = vec![0u8; len.max(4)];
        rng.fill(&mut data[..]);
        data[0..4].copy_from_slice(&kind.to_le_bytes());
        if let Ok(packet) = Packet::parse(&data) {
            assert_eq!(packet.kind(), kind);
        }
    }
}

#[test]
fn fuzz_ip_inspect_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..128);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        if let Some((_, total)) = ip::inspect(&data) {
            assert!(total <= data.len());
        }
    }
}

#[test]
fn random_mutation_of_valid_header_is_handled() {
    let mut rng = thread_rng();
    let mut packet = vec![0u8; DATA_MIN_SIZE + 8];
    write_transport_header(&mut packet, 0x0100, 3).unwrap();

    for _ in 0..1_000 {
        let mut mutated = packet.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        let _ = Packet::parse(&mutated);
    }
}

#[test]
fn initiation_size_is_enforced() {
    let mut data = vec![0u8; HANDSHAKE_INITIATION_SIZE];
    data[0..4].copy_from_slice(&MSG_HANDSHAKE_INITIATION.to_le_bytes());
    assert!(Packet::parse(&data).is_ok());
    assert!(Packet::parse(&data[..HANDSHAKE_INITIATION_SIZE - 1]).is_err());
}
