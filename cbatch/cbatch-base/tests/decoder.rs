use cbatch::decoder::{new_decoder_pool, DecodeBuffer, REPLACEMENT_CHAR};

#[test]
fn test_character_split_across_tokens() {
    let mut dec = DecodeBuffer::new();
    let bytes = "é".as_bytes();
    assert_eq!(bytes.len(), 2);

    assert_eq!(dec.push(&bytes[..1]), None);
    assert!(dec.has_partial());
    assert_eq!(dec.push(&bytes[1..]), Some("é".to_string()));
    assert!(dec.is_empty());
}

#[test]
fn test_text_withheld_until_character_completes() {
    let mut dec = DecodeBuffer::new();
    let euro = "€".as_bytes();
    let mut first = b"ab".to_vec();
    first.extend_from_slice(&euro[..2]);

    assert_eq!(dec.push(&first), None);
    assert_eq!(dec.push(&euro[2..]), Some("ab€".to_string()));
}

#[test]
fn test_four_byte_character_one_byte_at_a_time() {
    let mut dec = DecodeBuffer::new();
    let crab = "🦀".as_bytes();
    for b in &crab[..3] {
        assert_eq!(dec.push(std::slice::from_ref(b)), None);
    }
    assert_eq!(dec.push(&crab[3..]), Some("🦀".to_string()));
}

#[test]
fn test_invalid_bytes_become_replacement() {
    let mut dec = DecodeBuffer::new();
    assert_eq!(dec.push(&[0xff]), Some(REPLACEMENT_CHAR.to_string()));
    assert_eq!(
        dec.push(&[b'x', 0x80, b'y']),
        Some(format!("x{}y", REPLACEMENT_CHAR))
    );
}

#[test]
fn test_finish_marks_dangling_partial() {
    let mut dec = DecodeBuffer::new();
    assert_eq!(dec.finish(), None);

    let mut bytes = b"a".to_vec();
    bytes.extend_from_slice(&"€".as_bytes()[..2]);
    assert_eq!(dec.push(&bytes), None);
    assert_eq!(dec.finish(), Some(format!("a{}", REPLACEMENT_CHAR)));
    assert!(dec.is_empty());
}

#[test]
fn test_pooled_buffer_comes_back_empty() {
    let pool = new_decoder_pool();
    {
        let mut dec = pool.rent();
        assert_eq!(dec.push(&"€".as_bytes()[..1]), None);
    }
    let dec = pool.rent();
    assert!(dec.is_empty());
    assert_eq!(pool.stats().allocated, 1);
}
