use convene::wire::{read_ext_header, write_ext_header, Header, EXT_HEADER_LEN};

#[test]
fn header_round_trips_through_the_packed_word() {
    let h = Header {
        group_id: 0xBEEF,
        coll_id: 42,
        step_idx: 7,
        remote_offset: 0x1234_5678,
    };
    assert_eq!(Header::unpack(h.pack()), h);
}

#[test]
fn header_field_layout() {
    // group_id:16 | coll_id:8 | step_idx:8 | remote_offset:32
    let h = Header { group_id: 1, coll_id: 2, step_idx: 3, remote_offset: 4 };
    let raw = h.pack();
    assert_eq!(raw & 0xFFFF, 1);
    assert_eq!((raw >> 16) & 0xFF, 2);
    assert_eq!((raw >> 24) & 0xFF, 3);
    assert_eq!(raw >> 32, 4);
}

#[test]
fn local_id_combines_coll_and_step() {
    let h = Header { group_id: 9, coll_id: 0x10, step_idx: 0x02, remote_offset: 0 };
    assert_eq!(h.local_id(), 0x0210);
    assert_eq!(Header::make_local_id(0x10, 0x02), h.local_id());
}

#[test]
fn extension_carries_the_source_rank() {
    let mut buf = Vec::new();
    write_ext_header(77, &mut buf);
    buf.extend_from_slice(b"payload");
    let (rank, rest) = read_ext_header(&buf).unwrap();
    assert_eq!(rank, 77);
    assert_eq!(rest, b"payload");
}

#[test]
fn truncated_extension_is_rejected() {
    assert!(read_ext_header(&[0u8; EXT_HEADER_LEN - 1]).is_none());
}
