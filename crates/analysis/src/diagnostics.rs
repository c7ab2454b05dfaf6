//! Diagnostic records and the closed rule-id enumeration.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    /// SARIF levels: `note` for info, otherwise as-is.
    pub fn sarif_level(self) -> &'static str {
        match self {
            Severity::Info => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// Stable rule identifiers, one per diagnostic family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleId {
    StackOverflow,
    RecursiveFunction,
    InfiniteRecursion,
    DynamicAlloca,
    AllocaOversizedConstant,
    AllocaUserControlled,
    AllocaRecursiveControlled,
    AllocaInfiniteRecursive,
    StackBufferOverflowUpper,
    StackBufferOverflowLower,
    StackBufferOverflowConstant,
    MultipleStoresInfo,
    InvalidBaseReconstructionError,
    InvalidBaseReconstructionWarning,
    MemIntrinsicOverflow,
    SizeMinusKWrite,
    StackPointerEscapeReturn,
    StackPointerEscapeStoreGlobal,
    StackPointerEscapeStoreUnknown,
    StackPointerEscapeCallArg,
    StackPointerEscapeCallCallback,
    ConstParameterNotModifiedPointer,
    ConstParameterNotModifiedPointerConstOnly,
    ConstParameterNotModifiedReference,
    ConstParameterNotModifiedReferenceRvalue,
    ConstParameterNotModifiedReferenceRvaluePreferValue,
    DuplicateIfCondition,
}

impl RuleId {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleId::StackOverflow => "StackOverflow",
            RuleId::RecursiveFunction => "RecursiveFunction",
            RuleId::InfiniteRecursion => "InfiniteRecursion",
            RuleId::DynamicAlloca => "DynamicAlloca",
            RuleId::AllocaOversizedConstant => "AllocaOversizedConstant",
            RuleId::AllocaUserControlled => "AllocaUserControlled",
            RuleId::AllocaRecursiveControlled => "AllocaRecursiveControlled",
            RuleId::AllocaInfiniteRecursive => "AllocaInfiniteRecursive",
            RuleId::StackBufferOverflowUpper => "StackBufferOverflow.Upper",
            RuleId::StackBufferOverflowLower => "StackBufferOverflow.Lower",
            RuleId::StackBufferOverflowConstant => "StackBufferOverflow.Constant",
            RuleId::MultipleStoresInfo => "MultipleStoresInfo",
            RuleId::InvalidBaseReconstructionError => "InvalidBaseReconstruction.Error",
            RuleId::InvalidBaseReconstructionWarning => "InvalidBaseReconstruction.Warning",
            RuleId::MemIntrinsicOverflow => "MemIntrinsicOverflow",
            RuleId::SizeMinusKWrite => "SizeMinusKWrite",
            RuleId::StackPointerEscapeReturn => "StackPointerEscape.Return",
            RuleId::StackPointerEscapeStoreGlobal => "StackPointerEscape.StoreGlobal",
            RuleId::StackPointerEscapeStoreUnknown => "StackPointerEscape.StoreUnknown",
            RuleId::StackPointerEscapeCallArg => "StackPointerEscape.CallArg",
            RuleId::StackPointerEscapeCallCallback => "StackPointerEscape.CallCallback",
            RuleId::ConstParameterNotModifiedPointer => "ConstParameterNotModified.Pointer",
            RuleId::ConstParameterNotModifiedPointerConstOnly => {
                "ConstParameterNotModified.PointerConstOnly"
            }
            RuleId::ConstParameterNotModifiedReference => "ConstParameterNotModified.Reference",
            RuleId::ConstParameterNotModifiedReferenceRvalue => {
                "ConstParameterNotModified.ReferenceRvalue"
            }
            RuleId::ConstParameterNotModifiedReferenceRvaluePreferValue => {
                "ConstParameterNotModified.ReferenceRvaluePreferValue"
            }
            RuleId::DuplicateIfCondition => "DuplicateIfCondition",
        }
    }
}

/// One reported finding, already decorated with its source location.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub rule_id: RuleId,
    pub file_path: String,
    pub func_name: String,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub message: String,
    /// Intermediate variable names from the allocation to the pointer of
    /// interest, allocation first.
    pub alias_path: Vec<String>,
}
