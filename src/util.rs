#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}
#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    addr.wrapping_add(align - 1) & !align.wrapping_sub(1)
}

/// A bit range of a `usize` word, `SIZE` bits wide starting at `SHIFT`.
pub trait BitFieldTrait<const SHIFT: usize, const SIZE: usize> {
    const MASK: usize = ((1 << SHIFT) << SIZE) - (1 << SHIFT);

    fn encode(value: usize) -> usize {
        value.wrapping_shl(SHIFT as _) & Self::MASK
    }
    fn update(previous: usize, value: usize) -> usize {
        (previous & !Self::MASK) | Self::encode(value)
    }

    fn decode(value: usize) -> usize {
        (value & Self::MASK).wrapping_shr(SHIFT as _)
    }
}

/// Set while the collector is processing the node's generation.
pub struct CollectingBit;
/// Sticky: the object's finalizer already ran.
pub struct FinalizedBit;

impl BitFieldTrait<0, 1> for CollectingBit {}
impl BitFieldTrait<1, 1> for FinalizedBit {}

/// Bits of `GcHead::prev` that are not part of the address.
pub const PREV_FLAG_BITS: usize = CollectingBit::MASK | FinalizedBit::MASK;
pub const PREV_ADDR_MASK: usize = !PREV_FLAG_BITS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_down(4097, 4096), 4096);
    }

    #[test]
    fn prev_flag_bits_live_below_pointer_alignment() {
        assert_eq!(PREV_FLAG_BITS, 0b11);
        let word = FinalizedBit::update(0x1000, 1);
        let word = CollectingBit::update(word, 1);
        assert_eq!(word & PREV_ADDR_MASK, 0x1000);
        assert_eq!(FinalizedBit::decode(word), 1);
        assert_eq!(CollectingBit::decode(CollectingBit::update(word, 0)), 0);
    }
}
