//! Bitmap data structure helper, used to track chunk coverage of a stripe.

use std::fmt;

use crate::utils::StripeKvError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for u32 chunk ID -> bool mapping.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: u32, ones: bool) -> Self {
        let mut bitset = FixedBitSet::with_capacity(size as usize);
        if ones {
            bitset.set_range(.., true);
        }
        Bitmap(bitset)
    }

    /// Creates a new bitmap of given size with the listed indices set true.
    /// Indices out of bound are reported as an error.
    pub fn from_ones(
        size: u32,
        ones: impl IntoIterator<Item = u32>,
    ) -> Result<Self, StripeKvError> {
        let mut bitmap = Self::new(size, false);
        for idx in ones {
            bitmap.set(idx, true)?;
        }
        Ok(bitmap)
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: u32, flag: bool) -> Result<(), StripeKvError> {
        if idx as usize >= self.0.len() {
            return Err(StripeKvError(format!("index {} out of bound", idx)));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u32) -> Result<bool, StripeKvError> {
        if idx as usize >= self.0.len() {
            return Err(StripeKvError(format!("index {} out of bound", idx)));
        }
        Ok(self.0[idx as usize])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u32 {
        self.0.len() as u32
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u32 {
        self.0.count_ones(..) as u32
    }

    /// Allows `for (id, bit) in map.iter()`.
    #[inline]
    pub fn iter(&self) -> BitmapIter {
        BitmapIter { map: self, idx: 0 }
    }

    /// Iterates over the indices that are still false.
    pub fn zeros(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.0.len()).filter(|&i| !self.0[i]).map(|i| i as u32)
    }
}

/// Iterator over `Bitmap`, yielding `(id, bit)` pairs.
#[derive(Debug, Clone)]
pub struct BitmapIter<'m> {
    map: &'m Bitmap,
    idx: usize,
}

impl Iterator for BitmapIter<'_> {
    type Item = (u32, bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx < self.map.0.len() {
            let id = self.idx;
            self.idx += 1;
            Some((id as u32, self.map.0[id]))
        } else {
            None
        }
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self
            .iter()
            .filter_map(|(i, flag)| if flag { Some(i) } else { None })
        {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn bitmap_set_get() {
        let mut map = Bitmap::new(7, false);
        assert!(map.set(0, true).is_ok());
        assert!(map.set(1, false).is_ok());
        assert!(map.set(2, true).is_ok());
        assert!(map.set(7, true).is_err());
        assert_eq!(map.get(0), Ok(true));
        assert_eq!(map.get(1), Ok(false));
        assert_eq!(map.get(2), Ok(true));
        assert_eq!(map.get(3), Ok(false));
        assert!(map.get(7).is_err());
    }

    #[test]
    fn bitmap_from_ones() -> Result<(), StripeKvError> {
        let map = Bitmap::from_ones(6, [1, 4])?;
        assert_eq!(map.count(), 2);
        assert_eq!(map.zeros().collect::<Vec<_>>(), vec![0, 2, 3, 5]);
        assert!(Bitmap::from_ones(3, [3]).is_err());
        Ok(())
    }

    #[test]
    fn bitmap_iter() {
        let ref_map = [true, true, false, true, true];
        let mut map = Bitmap::new(5, true);
        assert!(map.set(2, false).is_ok());
        for (id, flag) in map.iter() {
            assert_eq!(ref_map[id as usize], flag);
        }
        assert_eq!(format!("{:?}", map), "{5; [0, 1, 3, 4]}");
    }
}
