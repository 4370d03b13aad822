//! ReQL term types and per-operator argument specifications.
//!
//! This module defines the supported query operations (terms) as an enum.
//! The discriminant values are the stable numeric ids an external parser
//! uses to identify operations; they never change once assigned.
//!
//! # Term Categories
//!
//! - **Core Data**: DATUM, MAKE_ARRAY, MAKE_OBJ
//! - **Functions**: VAR, FUNC, FUNCALL
//! - **Tables**: TABLE, GET
//! - **Comparison / Logic**: EQ..GE, NOT, AND, OR
//! - **Math**: ADD, SUB, MUL, DIV, MOD
//! - **Arrays & Sets**: APPEND, PREPEND, DIFFERENCE, SET_*, *_AT
//! - **Sequences**: SLICE, SKIP, LIMIT, NTH, IS_EMPTY, OFFSETS_OF, CONTAINS
//! - **Objects**: GET_FIELD, PLUCK, MERGE
//! - **Transforms & Aggregation**: FILTER, MAP, CONCAT_MAP, REDUCE, COUNT,
//!   SUM, AVG, MIN, MAX, GROUP, GROUPED_MAP_REDUCE
//! - **Control Flow**: BRANCH
//! - **Types**: TYPE_OF, COERCE_TO
//! - **Writes**: UPDATE, DELETE, REPLACE
//! - **Sugar** (expanded by the rewrite compiler, never evaluated directly):
//!   SKIP, UPDATE, DELETE, GROUP_BY, INNER_JOIN, OUTER_JOIN, EQ_JOIN

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum TermType {
    // Core data types
    Datum = 0,
    MakeArray = 1,
    MakeObj = 2,

    // Variables & functions
    Var = 3,

    // Tables
    Table = 10,
    Get = 11,

    // Comparison operators
    Eq = 13,
    Ne = 14,
    Lt = 15,
    Le = 16,
    Gt = 17,
    Ge = 18,

    // Logic operators
    Not = 19,

    // Math operators
    Add = 20,
    Sub = 21,
    Mul = 22,
    Div = 23,
    Mod = 24,

    // Array/Set operations
    Append = 28,
    Prepend = 29,
    Difference = 30,
    SetInsert = 31,
    SetIntersection = 32,
    SetUnion = 33,
    SetDifference = 34,

    // Sequence operations
    Slice = 35,
    Skip = 36,
    Limit = 37,
    Contains = 39,

    // Object operations
    GetField = 40,
    Pluck = 46,
    Merge = 48,

    // Aggregations & transformations
    Reduce = 50,
    Map = 51,
    Filter = 53,
    ConcatMap = 54,
    Count = 57,
    Nth = 60,

    // Joins (sugar)
    InnerJoin = 61,
    OuterJoin = 62,
    EqJoin = 63,

    // Function application & grouping
    Funcall = 64,
    GroupBy = 65,
    GroupedMapReduce = 66,

    // Array mutations
    InsertAt = 67,
    DeleteAt = 68,
    ChangeAt = 69,
    SpliceAt = 70,

    // Type operations
    CoerceTo = 71,
    TypeOf = 72,

    // Write operations
    Update = 73,
    Delete = 74,
    Replace = 75,

    // Sequence predicates & searches
    IsEmpty = 86,
    OffsetsOf = 87,

    // Control flow
    Branch = 99,
    Or = 100,
    And = 101,
    Func = 103,

    // Grouping
    Group = 152,
    Sum = 153,
    Avg = 154,
    Min = 155,
    Max = 156,
}

/// Declared optional-argument names for one operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optargs {
    /// Only the listed names are accepted.
    Only(&'static [&'static str]),
    /// Any name is accepted (MAKE_OBJ builds objects from its optargs).
    Any,
}

/// Positional/optional argument contract for one operator.
///
/// `max` of `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub min: usize,
    pub max: Option<usize>,
    pub optargs: Optargs,
}

const NO_OPTARGS: Optargs = Optargs::Only(&[]);

const fn exactly(n: usize) -> ArgSpec {
    ArgSpec {
        min: n,
        max: Some(n),
        optargs: NO_OPTARGS,
    }
}

const fn between(min: usize, max: usize) -> ArgSpec {
    ArgSpec {
        min,
        max: Some(max),
        optargs: NO_OPTARGS,
    }
}

const fn at_least(min: usize) -> ArgSpec {
    ArgSpec {
        min,
        max: None,
        optargs: NO_OPTARGS,
    }
}

impl TermType {
    /// Converts from a numeric term type id.
    ///
    /// # Returns
    ///
    /// * `Some(TermType)` - If the value maps to a known term type
    /// * `None` - If the value is unknown/unsupported
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(TermType::Datum),
            1 => Some(TermType::MakeArray),
            2 => Some(TermType::MakeObj),
            3 => Some(TermType::Var),
            10 => Some(TermType::Table),
            11 => Some(TermType::Get),
            13 => Some(TermType::Eq),
            14 => Some(TermType::Ne),
            15 => Some(TermType::Lt),
            16 => Some(TermType::Le),
            17 => Some(TermType::Gt),
            18 => Some(TermType::Ge),
            19 => Some(TermType::Not),
            20 => Some(TermType::Add),
            21 => Some(TermType::Sub),
            22 => Some(TermType::Mul),
            23 => Some(TermType::Div),
            24 => Some(TermType::Mod),
            28 => Some(TermType::Append),
            29 => Some(TermType::Prepend),
            30 => Some(TermType::Difference),
            31 => Some(TermType::SetInsert),
            32 => Some(TermType::SetIntersection),
            33 => Some(TermType::SetUnion),
            34 => Some(TermType::SetDifference),
            35 => Some(TermType::Slice),
            36 => Some(TermType::Skip),
            37 => Some(TermType::Limit),
            39 => Some(TermType::Contains),
            40 => Some(TermType::GetField),
            46 => Some(TermType::Pluck),
            48 => Some(TermType::Merge),
            50 => Some(TermType::Reduce),
            51 => Some(TermType::Map),
            53 => Some(TermType::Filter),
            54 => Some(TermType::ConcatMap),
            57 => Some(TermType::Count),
            60 => Some(TermType::Nth),
            61 => Some(TermType::InnerJoin),
            62 => Some(TermType::OuterJoin),
            63 => Some(TermType::EqJoin),
            64 => Some(TermType::Funcall),
            65 => Some(TermType::GroupBy),
            66 => Some(TermType::GroupedMapReduce),
            67 => Some(TermType::InsertAt),
            68 => Some(TermType::DeleteAt),
            69 => Some(TermType::ChangeAt),
            70 => Some(TermType::SpliceAt),
            71 => Some(TermType::CoerceTo),
            72 => Some(TermType::TypeOf),
            73 => Some(TermType::Update),
            74 => Some(TermType::Delete),
            75 => Some(TermType::Replace),
            86 => Some(TermType::IsEmpty),
            87 => Some(TermType::OffsetsOf),
            99 => Some(TermType::Branch),
            100 => Some(TermType::Or),
            101 => Some(TermType::And),
            103 => Some(TermType::Func),
            152 => Some(TermType::Group),
            153 => Some(TermType::Sum),
            154 => Some(TermType::Avg),
            155 => Some(TermType::Min),
            156 => Some(TermType::Max),
            _ => None,
        }
    }

    /// Converts to the numeric term type id.
    pub fn to_u64(self) -> u64 {
        self as u64
    }

    /// Returns the term type name as a string constant.
    ///
    /// This is useful for debugging, logging, and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            TermType::Datum => "DATUM",
            TermType::MakeArray => "MAKE_ARRAY",
            TermType::MakeObj => "MAKE_OBJ",
            TermType::Var => "VAR",
            TermType::Table => "TABLE",
            TermType::Get => "GET",
            TermType::Eq => "EQ",
            TermType::Ne => "NE",
            TermType::Lt => "LT",
            TermType::Le => "LE",
            TermType::Gt => "GT",
            TermType::Ge => "GE",
            TermType::Not => "NOT",
            TermType::Add => "ADD",
            TermType::Sub => "SUB",
            TermType::Mul => "MUL",
            TermType::Div => "DIV",
            TermType::Mod => "MOD",
            TermType::Append => "APPEND",
            TermType::Prepend => "PREPEND",
            TermType::Difference => "DIFFERENCE",
            TermType::SetInsert => "SET_INSERT",
            TermType::SetIntersection => "SET_INTERSECTION",
            TermType::SetUnion => "SET_UNION",
            TermType::SetDifference => "SET_DIFFERENCE",
            TermType::Slice => "SLICE",
            TermType::Skip => "SKIP",
            TermType::Limit => "LIMIT",
            TermType::Contains => "CONTAINS",
            TermType::GetField => "GET_FIELD",
            TermType::Pluck => "PLUCK",
            TermType::Merge => "MERGE",
            TermType::Reduce => "REDUCE",
            TermType::Map => "MAP",
            TermType::Filter => "FILTER",
            TermType::ConcatMap => "CONCAT_MAP",
            TermType::Count => "COUNT",
            TermType::Nth => "NTH",
            TermType::InnerJoin => "INNER_JOIN",
            TermType::OuterJoin => "OUTER_JOIN",
            TermType::EqJoin => "EQ_JOIN",
            TermType::Funcall => "FUNCALL",
            TermType::GroupBy => "GROUP_BY",
            TermType::GroupedMapReduce => "GROUPED_MAP_REDUCE",
            TermType::InsertAt => "INSERT_AT",
            TermType::DeleteAt => "DELETE_AT",
            TermType::ChangeAt => "CHANGE_AT",
            TermType::SpliceAt => "SPLICE_AT",
            TermType::CoerceTo => "COERCE_TO",
            TermType::TypeOf => "TYPE_OF",
            TermType::Update => "UPDATE",
            TermType::Delete => "DELETE",
            TermType::Replace => "REPLACE",
            TermType::IsEmpty => "IS_EMPTY",
            TermType::OffsetsOf => "OFFSETS_OF",
            TermType::Branch => "BRANCH",
            TermType::Or => "OR",
            TermType::And => "AND",
            TermType::Func => "FUNC",
            TermType::Group => "GROUP",
            TermType::Sum => "SUM",
            TermType::Avg => "AVG",
            TermType::Min => "MIN",
            TermType::Max => "MAX",
        }
    }

    /// The positional/optional argument contract checked before evaluation.
    pub fn arg_spec(self) -> ArgSpec {
        match self {
            TermType::Datum => exactly(0),
            TermType::MakeArray => at_least(0),
            TermType::MakeObj => ArgSpec {
                min: 0,
                max: Some(0),
                optargs: Optargs::Any,
            },
            TermType::Var => exactly(1),
            TermType::Table => exactly(1),
            TermType::Get => exactly(2),
            TermType::Eq
            | TermType::Ne
            | TermType::Lt
            | TermType::Le
            | TermType::Gt
            | TermType::Ge => exactly(2),
            TermType::Not => exactly(1),
            TermType::Add | TermType::Sub | TermType::Mul => at_least(2),
            TermType::Div | TermType::Mod => exactly(2),
            TermType::Append | TermType::Prepend => exactly(2),
            TermType::Difference
            | TermType::SetInsert
            | TermType::SetIntersection
            | TermType::SetUnion
            | TermType::SetDifference => exactly(2),
            TermType::Slice => ArgSpec {
                min: 2,
                max: Some(3),
                optargs: Optargs::Only(&["left_bound", "right_bound"]),
            },
            TermType::Skip => exactly(2),
            TermType::Limit => exactly(2),
            TermType::Contains => at_least(2),
            TermType::GetField => exactly(2),
            TermType::Pluck => at_least(2),
            TermType::Merge => at_least(2),
            TermType::Reduce => exactly(2),
            TermType::Map => exactly(2),
            TermType::Filter => exactly(2),
            TermType::ConcatMap => exactly(2),
            TermType::Count => exactly(1),
            TermType::Nth => exactly(2),
            TermType::InnerJoin | TermType::OuterJoin | TermType::EqJoin => exactly(3),
            TermType::Funcall => at_least(1),
            TermType::GroupBy => exactly(3),
            TermType::GroupedMapReduce => exactly(4),
            TermType::InsertAt | TermType::ChangeAt | TermType::SpliceAt => exactly(3),
            TermType::DeleteAt => between(2, 3),
            TermType::CoerceTo => exactly(2),
            TermType::TypeOf => exactly(1),
            TermType::Update => exactly(2),
            TermType::Delete => exactly(1),
            TermType::Replace => ArgSpec {
                min: 2,
                max: Some(2),
                optargs: Optargs::Only(&["non_atomic"]),
            },
            TermType::IsEmpty => exactly(1),
            TermType::OffsetsOf => exactly(2),
            TermType::Branch => exactly(3),
            TermType::Or | TermType::And => at_least(1),
            TermType::Func => exactly(2),
            TermType::Group => exactly(2),
            TermType::Sum | TermType::Avg => between(1, 2),
            TermType::Min | TermType::Max => exactly(1),
        }
    }

    /// Sugared surface terms the rewrite compiler expands; the evaluator
    /// never sees them.
    pub fn is_sugar(self) -> bool {
        matches!(
            self,
            TermType::Skip
                | TermType::Update
                | TermType::Delete
                | TermType::GroupBy
                | TermType::InnerJoin
                | TermType::OuterJoin
                | TermType::EqJoin
        )
    }

    /// Whether the first argument is consumed as a sequence. Operators with
    /// this flag that are not group-aware go through the grouped-data
    /// fan-out wrapper.
    pub fn takes_sequence(self) -> bool {
        matches!(
            self,
            TermType::Nth
                | TermType::Append
                | TermType::Prepend
                | TermType::Difference
                | TermType::SetInsert
                | TermType::SetIntersection
                | TermType::SetUnion
                | TermType::SetDifference
                | TermType::Slice
                | TermType::Limit
                | TermType::Contains
                | TermType::Pluck
                | TermType::Reduce
                | TermType::Map
                | TermType::Filter
                | TermType::ConcatMap
                | TermType::Count
                | TermType::InsertAt
                | TermType::DeleteAt
                | TermType::ChangeAt
                | TermType::SpliceAt
                | TermType::CoerceTo
                | TermType::IsEmpty
                | TermType::OffsetsOf
                | TermType::Sum
                | TermType::Avg
                | TermType::Min
                | TermType::Max
        )
    }

    /// Operators that handle grouped data themselves instead of going through
    /// the generic fan-out wrapper.
    pub fn is_group_aware(self) -> bool {
        matches!(
            self,
            TermType::Nth | TermType::Group | TermType::GroupedMapReduce | TermType::TypeOf
        )
    }

    /// Whether two evaluations of the same term over the same inputs are
    /// guaranteed to produce the same value. Reads and writes against the
    /// table collaborator are not.
    pub fn is_deterministic(self) -> bool {
        !matches!(self, TermType::Table | TermType::Get | TermType::Replace)
    }

    /// Whether evaluation mutates state outside the query.
    pub fn has_side_effects(self) -> bool {
        matches!(self, TermType::Replace)
    }
}

impl std::fmt::Display for TermType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_type_conversion() {
        assert_eq!(TermType::from_u64(0), Some(TermType::Datum));
        assert_eq!(TermType::from_u64(1), Some(TermType::MakeArray));
        assert_eq!(TermType::from_u64(13), Some(TermType::Eq));
        assert_eq!(TermType::from_u64(87), Some(TermType::OffsetsOf));
        assert_eq!(TermType::from_u64(999), None);
    }

    #[test]
    fn test_term_type_to_u64() {
        assert_eq!(TermType::Datum.to_u64(), 0);
        assert_eq!(TermType::Nth.to_u64(), 60);
        assert_eq!(TermType::Group.to_u64(), 152);
    }

    #[test]
    fn test_term_type_names() {
        assert_eq!(TermType::Datum.name(), "DATUM");
        assert_eq!(TermType::SetUnion.name(), "SET_UNION");
        assert_eq!(TermType::GroupedMapReduce.name(), "GROUPED_MAP_REDUCE");
    }

    #[test]
    fn test_round_trip_all_ids() {
        for id in 0..200 {
            if let Some(tt) = TermType::from_u64(id) {
                assert_eq!(tt.to_u64(), id);
            }
        }
    }

    #[test]
    fn test_arg_specs() {
        let slice = TermType::Slice.arg_spec();
        assert_eq!(slice.min, 2);
        assert_eq!(slice.max, Some(3));
        assert!(matches!(slice.optargs, Optargs::Only(names) if names.contains(&"left_bound")));

        let make_obj = TermType::MakeObj.arg_spec();
        assert_eq!(make_obj.optargs, Optargs::Any);

        assert_eq!(TermType::Contains.arg_spec().max, None);
    }

    #[test]
    fn test_flags() {
        assert!(TermType::Skip.is_sugar());
        assert!(!TermType::Slice.is_sugar());
        assert!(TermType::Nth.is_group_aware());
        assert!(!TermType::Limit.is_group_aware());
        assert!(TermType::Limit.takes_sequence());
        assert!(!TermType::Replace.is_deterministic());
        assert!(TermType::Replace.has_side_effects());
        assert!(TermType::Nth.is_deterministic());
    }
}
