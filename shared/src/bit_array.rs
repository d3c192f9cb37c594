#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitArray<T>(pub T);

macro_rules! impl_bitarray {
    ($($t: ty),*) => {
        $(
            impl BitArray<$t> {
                pub const BITS: usize = <$t>::BITS as usize;

                pub const fn get(&self, idx: usize) -> bool {
                    (self.0 >> idx & 1) != 0
                }

                /// Returns `true` if every bit in `low..high` is clear.
                pub const fn range_clear(&self, low: usize, high: usize) -> bool {
                    self.0 & Self::mask(low, high) == 0
                }

                /// Returns `true` if every bit in `low..high` is set.
                pub const fn range_set(&self, low: usize, high: usize) -> bool {
                    let mask = Self::mask(low, high);
                    self.0 & mask == mask
                }

                pub const fn with(self, value: bool, idx: usize) -> Self {
                    if value {
                        BitArray(self.0 | 1 << idx)
                    } else {
                        BitArray(self.0 & !(1 << idx))
                    }
                }

                pub const fn with_range(self, value: bool, low: usize, high: usize) -> Self {
                    let mask = Self::mask(low, high);
                    if value {
                        BitArray(self.0 | mask)
                    } else {
                        BitArray(self.0 & !mask)
                    }
                }

                pub const fn count_ones(&self) -> usize {
                    self.0.count_ones() as usize
                }

                pub const fn load(self) -> $t {
                    self.0
                }

                const fn mask(low: usize, high: usize) -> $t {
                    if high - low == Self::BITS {
                        <$t>::MAX
                    } else {
                        ((1 << (high - low)) - 1) << low
                    }
                }
            }
        )*
    };
}

impl_bitarray!(u8, u16, u32, u64);
