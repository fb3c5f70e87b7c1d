use crate::errors::{Error, Result};

/// Packed TX offload context, consumed by the driver when `ol_flags` asks
/// for hardware work.
///
/// | field        | bits | offset |
/// |--------------|------|--------|
/// | l2_len       | 7    | 0      |
/// | l3_len       | 9    | 7      |
/// | l4_len       | 8    | 16     |
/// | tso_segsz    | 16   | 24     |
/// | outer_l3_len | 9    | 40     |
/// | outer_l2_len | 7    | 49     |
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxOffload(pub u64);

#[derive(Clone, Copy, Debug)]
struct Field {
    name: &'static str,
    offset: u32,
    width: u32,
}

impl Field {
    const fn max(self) -> u64 {
        (1 << self.width) - 1
    }

    const fn mask(self) -> u64 {
        self.max() << self.offset
    }
}

const L2_LEN: Field = Field {
    name: "l2_len",
    offset: 0,
    width: 7,
};
const L3_LEN: Field = Field {
    name: "l3_len",
    offset: 7,
    width: 9,
};
const L4_LEN: Field = Field {
    name: "l4_len",
    offset: 16,
    width: 8,
};
const TSO_SEGSZ: Field = Field {
    name: "tso_segsz",
    offset: 24,
    width: 16,
};
const OUTER_L3_LEN: Field = Field {
    name: "outer_l3_len",
    offset: 40,
    width: 9,
};
const OUTER_L2_LEN: Field = Field {
    name: "outer_l2_len",
    offset: 49,
    width: 7,
};

impl TxOffload {
    #[inline]
    fn get(self, field: Field) -> u64 {
        (self.0 & field.mask()) >> field.offset
    }

    #[inline]
    fn set(&mut self, field: Field, value: u64) -> Result<()> {
        if value > field.max() {
            return Err(Error::FieldOverflow {
                field: field.name,
                value,
                max: field.max(),
            });
        }
        self.0 = (self.0 & !field.mask()) | (value << field.offset);
        Ok(())
    }

    pub fn l2_len(self) -> u64 {
        self.get(L2_LEN)
    }

    pub fn set_l2_len(&mut self, val: u64) -> Result<()> {
        self.set(L2_LEN, val)
    }

    pub fn l3_len(self) -> u64 {
        self.get(L3_LEN)
    }

    pub fn set_l3_len(&mut self, val: u64) -> Result<()> {
        self.set(L3_LEN, val)
    }

    pub fn l4_len(self) -> u64 {
        self.get(L4_LEN)
    }

    pub fn set_l4_len(&mut self, val: u64) -> Result<()> {
        self.set(L4_LEN, val)
    }

    pub fn tso_segsz(self) -> u64 {
        self.get(TSO_SEGSZ)
    }

    pub fn set_tso_segsz(&mut self, val: u64) -> Result<()> {
        self.set(TSO_SEGSZ, val)
    }

    pub fn outer_l3_len(self) -> u64 {
        self.get(OUTER_L3_LEN)
    }

    pub fn set_outer_l3_len(&mut self, val: u64) -> Result<()> {
        self.set(OUTER_L3_LEN, val)
    }

    pub fn outer_l2_len(self) -> u64 {
        self.get(OUTER_L2_LEN)
    }

    pub fn set_outer_l2_len(&mut self, val: u64) -> Result<()> {
        self.set(OUTER_L2_LEN, val)
    }

    /// Writes every header length at once; nothing is written if one of
    /// them is out of range.
    pub fn with_header_lengths(self, lens: HeaderLengths) -> Result<Self> {
        let mut out = self;
        out.set_l2_len(lens.l2 as u64)?;
        out.set_l3_len(lens.l3 as u64)?;
        out.set_l4_len(lens.l4 as u64)?;
        out.set_outer_l2_len(lens.outer_l2 as u64)?;
        out.set_outer_l3_len(lens.outer_l3 as u64)?;
        Ok(out)
    }

    pub fn header_lengths(self) -> HeaderLengths {
        HeaderLengths {
            l2: self.l2_len() as u16,
            l3: self.l3_len() as u16,
            l4: self.l4_len() as u16,
            outer_l2: self.outer_l2_len() as u16,
            outer_l3: self.outer_l3_len() as u16,
        }
    }
}

/// Header lengths in bytes, as the driver needs them for checksum and
/// segmentation offloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeaderLengths {
    pub l2: u16,
    pub l3: u16,
    pub l4: u16,
    pub outer_l2: u16,
    pub outer_l3: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_land_on_their_bits() {
        let mut tx = TxOffload::default();
        tx.set_l2_len(14).unwrap();
        tx.set_l3_len(20).unwrap();
        tx.set_l4_len(32).unwrap();
        tx.set_tso_segsz(1448).unwrap();
        tx.set_outer_l3_len(20).unwrap();
        tx.set_outer_l2_len(14).unwrap();
        let expected: u64 = 14 | (20 << 7) | (32 << 16) | (1448 << 24) | (20 << 40) | (14 << 49);
        assert_eq!(tx.0, expected);
        assert_eq!(tx.l2_len(), 14);
        assert_eq!(tx.l3_len(), 20);
        assert_eq!(tx.l4_len(), 32);
        assert_eq!(tx.tso_segsz(), 1448);
        assert_eq!(tx.outer_l3_len(), 20);
        assert_eq!(tx.outer_l2_len(), 14);
    }

    #[test]
    fn setting_a_field_leaves_neighbours_alone() {
        let mut tx = TxOffload(u64::MAX);
        tx.set_l3_len(0).unwrap();
        assert_eq!(tx.l2_len(), 127);
        assert_eq!(tx.l3_len(), 0);
        assert_eq!(tx.l4_len(), 255);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut tx = TxOffload::default();
        let err = tx.set_l2_len(128).unwrap_err();
        assert!(matches!(
            err,
            Error::FieldOverflow {
                field: "l2_len",
                value: 128,
                max: 127
            }
        ));
        assert_eq!(tx, TxOffload::default());
    }

    #[test]
    fn header_lengths_are_all_or_nothing() {
        let tx = TxOffload::default();
        let lens = HeaderLengths {
            l2: 14,
            l3: 600,
            ..Default::default()
        };
        assert!(tx.with_header_lengths(lens).is_err());

        let lens = HeaderLengths {
            l2: 14,
            l3: 40,
            l4: 20,
            outer_l2: 14,
            outer_l3: 20,
        };
        let tx = tx.with_header_lengths(lens).unwrap();
        assert_eq!(tx.header_lengths(), lens);
    }
}
