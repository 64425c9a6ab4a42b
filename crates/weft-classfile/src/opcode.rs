//! Instruction set of the compiled-class format
//!
//! Opcodes are single bytes, organized into ranges:
//! - 0x00-0x0F: Stack manipulation & constants
//! - 0x10-0x1F: Local variables
//! - 0x20-0x2F: Arithmetic & conversions
//! - 0x30-0x3F: Control flow
//! - 0x40-0x4F: Returns & throw
//! - 0x50-0x5F: Fields, invocations & types (u16 pool operand)
//! - 0xF0: Call-original marker (patch code only)

/// Bytecode opcode enumeration
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Stack Manipulation & Constants (0x00-0x0F) =====
    /// No operation
    Nop = 0x00,
    /// Discard one single-slot value
    Pop = 0x01,
    /// Discard one two-slot value (long or double)
    Pop2 = 0x02,
    /// Duplicate the top value
    Dup = 0x03,
    /// Swap the top two single-slot values
    Swap = 0x04,
    /// Push null
    AConstNull = 0x05,
    /// Push an int (operand: i32)
    IConst = 0x06,
    /// Push a long (operand: i64)
    LConst = 0x07,
    /// Push a double (operand: f64)
    DConst = 0x08,
    /// Push a pool constant (operand: u16 pool index)
    Ldc = 0x09,

    // ===== Local Variables (0x10-0x1F) =====
    /// Load int local (operand: u16 slot)
    ILoad = 0x10,
    /// Load long local (operand: u16 slot)
    LLoad = 0x11,
    /// Load double local (operand: u16 slot)
    DLoad = 0x12,
    /// Load reference local (operand: u16 slot)
    ALoad = 0x13,
    /// Store int local (operand: u16 slot)
    IStore = 0x14,
    /// Store long local (operand: u16 slot)
    LStore = 0x15,
    /// Store double local (operand: u16 slot)
    DStore = 0x16,
    /// Store reference local (operand: u16 slot)
    AStore = 0x17,
    /// Increment int local (operands: u16 slot, i16 delta)
    IInc = 0x18,

    // ===== Arithmetic & Conversions (0x20-0x2F) =====
    /// Int addition
    IAdd = 0x20,
    /// Int subtraction
    ISub = 0x21,
    /// Int multiplication
    IMul = 0x22,
    /// Int division
    IDiv = 0x23,
    /// Int negation
    INeg = 0x24,
    /// Long addition
    LAdd = 0x25,
    /// Long subtraction
    LSub = 0x26,
    /// Long multiplication
    LMul = 0x27,
    /// Double addition
    DAdd = 0x28,
    /// Double subtraction
    DSub = 0x29,
    /// Double multiplication
    DMul = 0x2A,
    /// Double division
    DDiv = 0x2B,
    /// Int to long
    I2L = 0x2C,
    /// Long to int
    L2I = 0x2D,
    /// Int to double
    I2D = 0x2E,
    /// Long comparison, pushes -1, 0 or 1
    LCmp = 0x2F,

    // ===== Control Flow (0x30-0x3F) =====
    /// Unconditional branch (operand: i32 relative offset)
    Goto = 0x30,
    /// Branch if int == 0
    IfEq = 0x31,
    /// Branch if int != 0
    IfNe = 0x32,
    /// Branch if int < 0
    IfLt = 0x33,
    /// Branch if int >= 0
    IfGe = 0x34,
    /// Branch if int > 0
    IfGt = 0x35,
    /// Branch if int <= 0
    IfLe = 0x36,
    /// Branch if a == b (ints)
    IfICmpEq = 0x37,
    /// Branch if a != b (ints)
    IfICmpNe = 0x38,
    /// Branch if a < b (ints)
    IfICmpLt = 0x39,
    /// Branch if a >= b (ints)
    IfICmpGe = 0x3A,
    /// Branch if reference is null
    IfNull = 0x3B,
    /// Branch if reference is not null
    IfNonNull = 0x3C,
    /// Jump table (operands: i32 low, u16 count, i32 default, count x i32)
    TableSwitch = 0x3D,

    // ===== Returns (0x40-0x4F) =====
    /// Return int
    IReturn = 0x40,
    /// Return long
    LReturn = 0x41,
    /// Return double
    DReturn = 0x42,
    /// Return reference
    AReturn = 0x43,
    /// Return void
    Return = 0x44,
    /// Throw the reference on top of the stack
    AThrow = 0x45,

    // ===== Members & Types (0x50-0x5F) =====
    /// Read instance field (operand: u16 FieldRef)
    GetField = 0x50,
    /// Write instance field (operand: u16 FieldRef)
    PutField = 0x51,
    /// Read static field (operand: u16 FieldRef)
    GetStatic = 0x52,
    /// Write static field (operand: u16 FieldRef)
    PutStatic = 0x53,
    /// Virtual call (operand: u16 MethodRef)
    InvokeVirtual = 0x54,
    /// Non-virtual call: constructors, private and super methods (operand: u16 MethodRef)
    InvokeSpecial = 0x55,
    /// Static call (operand: u16 MethodRef)
    InvokeStatic = 0x56,
    /// Interface call (operand: u16 InterfaceMethodRef)
    InvokeInterface = 0x57,
    /// Allocate an instance (operand: u16 Class)
    New = 0x58,
    /// Checked cast (operand: u16 Class)
    CheckCast = 0x59,
    /// Type test, pushes int (operand: u16 Class)
    InstanceOf = 0x5A,

    // ===== Weaving (0xF0) =====
    /// Placeholder where the original method body is spliced in
    CallOriginal = 0xF0,
}

impl Opcode {
    /// Decode an opcode byte
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Nop),
            0x01 => Some(Self::Pop),
            0x02 => Some(Self::Pop2),
            0x03 => Some(Self::Dup),
            0x04 => Some(Self::Swap),
            0x05 => Some(Self::AConstNull),
            0x06 => Some(Self::IConst),
            0x07 => Some(Self::LConst),
            0x08 => Some(Self::DConst),
            0x09 => Some(Self::Ldc),

            0x10 => Some(Self::ILoad),
            0x11 => Some(Self::LLoad),
            0x12 => Some(Self::DLoad),
            0x13 => Some(Self::ALoad),
            0x14 => Some(Self::IStore),
            0x15 => Some(Self::LStore),
            0x16 => Some(Self::DStore),
            0x17 => Some(Self::AStore),
            0x18 => Some(Self::IInc),

            0x20 => Some(Self::IAdd),
            0x21 => Some(Self::ISub),
            0x22 => Some(Self::IMul),
            0x23 => Some(Self::IDiv),
            0x24 => Some(Self::INeg),
            0x25 => Some(Self::LAdd),
            0x26 => Some(Self::LSub),
            0x27 => Some(Self::LMul),
            0x28 => Some(Self::DAdd),
            0x29 => Some(Self::DSub),
            0x2A => Some(Self::DMul),
            0x2B => Some(Self::DDiv),
            0x2C => Some(Self::I2L),
            0x2D => Some(Self::L2I),
            0x2E => Some(Self::I2D),
            0x2F => Some(Self::LCmp),

            0x30 => Some(Self::Goto),
            0x31 => Some(Self::IfEq),
            0x32 => Some(Self::IfNe),
            0x33 => Some(Self::IfLt),
            0x34 => Some(Self::IfGe),
            0x35 => Some(Self::IfGt),
            0x36 => Some(Self::IfLe),
            0x37 => Some(Self::IfICmpEq),
            0x38 => Some(Self::IfICmpNe),
            0x39 => Some(Self::IfICmpLt),
            0x3A => Some(Self::IfICmpGe),
            0x3B => Some(Self::IfNull),
            0x3C => Some(Self::IfNonNull),
            0x3D => Some(Self::TableSwitch),

            0x40 => Some(Self::IReturn),
            0x41 => Some(Self::LReturn),
            0x42 => Some(Self::DReturn),
            0x43 => Some(Self::AReturn),
            0x44 => Some(Self::Return),
            0x45 => Some(Self::AThrow),

            0x50 => Some(Self::GetField),
            0x51 => Some(Self::PutField),
            0x52 => Some(Self::GetStatic),
            0x53 => Some(Self::PutStatic),
            0x54 => Some(Self::InvokeVirtual),
            0x55 => Some(Self::InvokeSpecial),
            0x56 => Some(Self::InvokeStatic),
            0x57 => Some(Self::InvokeInterface),
            0x58 => Some(Self::New),
            0x59 => Some(Self::CheckCast),
            0x5A => Some(Self::InstanceOf),

            0xF0 => Some(Self::CallOriginal),

            _ => None,
        }
    }

    /// Encode to a byte
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Mnemonic used by the disassembler
    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Pop => "POP",
            Self::Pop2 => "POP2",
            Self::Dup => "DUP",
            Self::Swap => "SWAP",
            Self::AConstNull => "ACONST_NULL",
            Self::IConst => "ICONST",
            Self::LConst => "LCONST",
            Self::DConst => "DCONST",
            Self::Ldc => "LDC",
            Self::ILoad => "ILOAD",
            Self::LLoad => "LLOAD",
            Self::DLoad => "DLOAD",
            Self::ALoad => "ALOAD",
            Self::IStore => "ISTORE",
            Self::LStore => "LSTORE",
            Self::DStore => "DSTORE",
            Self::AStore => "ASTORE",
            Self::IInc => "IINC",
            Self::IAdd => "IADD",
            Self::ISub => "ISUB",
            Self::IMul => "IMUL",
            Self::IDiv => "IDIV",
            Self::INeg => "INEG",
            Self::LAdd => "LADD",
            Self::LSub => "LSUB",
            Self::LMul => "LMUL",
            Self::DAdd => "DADD",
            Self::DSub => "DSUB",
            Self::DMul => "DMUL",
            Self::DDiv => "DDIV",
            Self::I2L => "I2L",
            Self::L2I => "L2I",
            Self::I2D => "I2D",
            Self::LCmp => "LCMP",
            Self::Goto => "GOTO",
            Self::IfEq => "IFEQ",
            Self::IfNe => "IFNE",
            Self::IfLt => "IFLT",
            Self::IfGe => "IFGE",
            Self::IfGt => "IFGT",
            Self::IfLe => "IFLE",
            Self::IfICmpEq => "IF_ICMPEQ",
            Self::IfICmpNe => "IF_ICMPNE",
            Self::IfICmpLt => "IF_ICMPLT",
            Self::IfICmpGe => "IF_ICMPGE",
            Self::IfNull => "IFNULL",
            Self::IfNonNull => "IFNONNULL",
            Self::TableSwitch => "TABLESWITCH",
            Self::IReturn => "IRETURN",
            Self::LReturn => "LRETURN",
            Self::DReturn => "DRETURN",
            Self::AReturn => "ARETURN",
            Self::Return => "RETURN",
            Self::AThrow => "ATHROW",
            Self::GetField => "GETFIELD",
            Self::PutField => "PUTFIELD",
            Self::GetStatic => "GETSTATIC",
            Self::PutStatic => "PUTSTATIC",
            Self::InvokeVirtual => "INVOKEVIRTUAL",
            Self::InvokeSpecial => "INVOKESPECIAL",
            Self::InvokeStatic => "INVOKESTATIC",
            Self::InvokeInterface => "INVOKEINTERFACE",
            Self::New => "NEW",
            Self::CheckCast => "CHECKCAST",
            Self::InstanceOf => "INSTANCEOF",
            Self::CallOriginal => "CALL_ORIGINAL",
        }
    }

    /// Conditional or unconditional single-target branch
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Self::Goto
                | Self::IfEq
                | Self::IfNe
                | Self::IfLt
                | Self::IfGe
                | Self::IfGt
                | Self::IfLe
                | Self::IfICmpEq
                | Self::IfICmpNe
                | Self::IfICmpLt
                | Self::IfICmpGe
                | Self::IfNull
                | Self::IfNonNull
        )
    }

    /// Return instruction (any width)
    pub fn is_return(self) -> bool {
        matches!(
            self,
            Self::IReturn | Self::LReturn | Self::DReturn | Self::AReturn | Self::Return
        )
    }

    /// Control never falls through to the next instruction
    pub fn is_terminator(self) -> bool {
        self.is_return() || matches!(self, Self::Goto | Self::AThrow | Self::TableSwitch)
    }

    /// Operand is a u16 local slot
    pub fn is_local_access(self) -> bool {
        matches!(
            self,
            Self::ILoad
                | Self::LLoad
                | Self::DLoad
                | Self::ALoad
                | Self::IStore
                | Self::LStore
                | Self::DStore
                | Self::AStore
        )
    }

    /// Operand is a u16 pool index
    pub fn is_pool_access(self) -> bool {
        matches!(self, Self::Ldc) || (0x50..=0x5A).contains(&self.to_u8())
    }

    /// Method invocation
    pub fn is_invoke(self) -> bool {
        matches!(
            self,
            Self::InvokeVirtual | Self::InvokeSpecial | Self::InvokeStatic | Self::InvokeInterface
        )
    }
}
