// Instruction formats and encoding tables.

/// One named bitfield of an instruction format.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub bits: u32,
}

/// An ordered list of named bitfields totalling one machine word.
#[derive(Debug, Clone, Copy)]
pub struct InstructionFormat {
    pub name: &'static str,
    pub fields: &'static [Field],
}

impl InstructionFormat {
    /// Total width of the format in bits.
    pub fn width(&self) -> u32 {
        self.fields.iter().map(|field| field.bits).sum()
    }

    /// Pack named field values into a single word.
    ///
    /// Fields are packed MSB-first in declaration order. Each value is
    /// truncated to its declared width (`value mod 2^width`), which also
    /// gives negative immediates their two's-complement bit pattern. A
    /// field without a supplied value packs as zero.
    pub fn encode(&self, values: &[(&str, i64)]) -> u32 {
        let mut word: u32 = 0;
        for field in self.fields {
            let value = values
                .iter()
                .find(|(name, _)| *name == field.name)
                .map(|(_, value)| *value)
                .unwrap_or(0);
            let mask = if field.bits >= 32 {
                u32::MAX
            } else {
                (1u32 << field.bits) - 1
            };
            word = (word << field.bits) | ((value as u32) & mask);
        }
        word
    }
}

/// The I-type layout: 6-bit opcode, two 5-bit registers, 16-bit immediate.
pub const I_TYPE: InstructionFormat = InstructionFormat {
    name: "I",
    fields: &[
        Field {
            name: "op",
            bits: 6,
        },
        Field {
            name: "rs",
            bits: 5,
        },
        Field {
            name: "rt",
            bits: 5,
        },
        Field {
            name: "imm",
            bits: 16,
        },
    ],
};

/// How a mnemonic's source operands map onto named fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgBinding {
    /// `rt, rs, imm` — three plain operands.
    RtRsImm,
    /// `rt, imm` — immediate only, `rs` left at zero.
    RtImm,
    /// `rt, imm(rs)` — register plus a base+offset operand.
    RtImmOffsetRs,
}

impl ArgBinding {
    pub fn operand_count(self) -> usize {
        match self {
            ArgBinding::RtRsImm => 3,
            ArgBinding::RtImm | ArgBinding::RtImmOffsetRs => 2,
        }
    }
}

/// One table entry per supported mnemonic.
#[derive(Debug, Clone, Copy)]
pub struct InstructionDef {
    pub mnemonic: &'static str,
    pub opcode: u8,
    pub format: &'static InstructionFormat,
    pub binding: ArgBinding,
}

pub const INSTRUCTION_TABLE: &[InstructionDef] = &[
    InstructionDef {
        mnemonic: "addiu",
        opcode: 0b001001,
        format: &I_TYPE,
        binding: ArgBinding::RtRsImm,
    },
    InstructionDef {
        mnemonic: "lui",
        opcode: 0b001111,
        format: &I_TYPE,
        binding: ArgBinding::RtImm,
    },
    InstructionDef {
        mnemonic: "lw",
        opcode: 0b100011,
        format: &I_TYPE,
        binding: ArgBinding::RtImmOffsetRs,
    },
    InstructionDef {
        mnemonic: "sw",
        opcode: 0b101011,
        format: &I_TYPE,
        binding: ArgBinding::RtImmOffsetRs,
    },
];

/// Look up an instruction definition by mnemonic, case-insensitively.
pub fn lookup(mnemonic: &str) -> Option<&'static InstructionDef> {
    INSTRUCTION_TABLE
        .iter()
        .find(|inst| inst.mnemonic.eq_ignore_ascii_case(mnemonic))
}
