mod common;

use common::two_mcu_chain;
use jtag_bscan::register::RegisterImage;
use jtag_bscan::statemachine::Register;
use proptest::prelude::*;

proptest! {
    #[test]
    fn set_word_leaves_neighbours_alone(
        bits in proptest::collection::vec(any::<bool>(), 64..200),
        offset in 0usize..64,
        width in 1usize..=64,
        value in any::<u64>(),
    ) {
        prop_assume!(offset + width <= bits.len());
        let mut image = RegisterImage::from_bits(&bits);
        image.set_word(offset, width, value);

        let mask = if width == 64 { u64::MAX } else { (1 << width) - 1 };
        prop_assert_eq!(image.word(offset, width), value & mask);
        for (i, bit) in bits.iter().enumerate() {
            if i < offset || i >= offset + width {
                prop_assert_eq!(image.get(i), *bit);
            }
        }
    }

    #[test]
    fn stream_order_is_a_permutation(bits in proptest::collection::vec(any::<bool>(), 18)) {
        let chain = two_mcu_chain();
        let image = RegisterImage::from_bits(&bits);
        let stream = chain.to_stream(Register::Data, &image).unwrap();
        prop_assert_eq!(stream.len(), 18);
        // device 1 (TDO end) leads the stream
        prop_assert_eq!(&stream[..9], &bits[9..]);
        prop_assert_eq!(&stream[9..], &bits[..9]);
        prop_assert_eq!(chain.from_stream(Register::Data, &stream).unwrap(), image);
    }
}

#[test]
fn fill_and_debug() {
    let mut image = RegisterImage::new(10);
    image.fill(true);
    assert_eq!(image.word(0, 10), 0x3ff);
    assert_eq!(image.as_bytes(), &[0xff, 0x03]);
    image.set(9, false);
    assert_eq!(format!("{:?}", image), "RegisterImage[10; 0111111111]");
}
