//! Closed registry of select functions and aggregations.
//!
//! Anything not listed here is rejected. Each entry declares the shape of its
//! arguments; literal arguments are escaped, column arguments are resolved
//! against the allowed columns by the caller.

use serde_json::Value;

/// How a function result participates in grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionClass {
    /// Per-row expression
    Scalar,
    Aggregation,
    /// Derived from the whole allowed row
    Computed,
}

/// Expected shape of one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Column,
    /// Column name when one matches, otherwise a text literal
    ColumnOrText,
    Integer,
    Text,
    /// Any scalar literal
    Literal,
    /// One of a fixed set of keywords, rendered as a quoted literal
    Keyword(&'static [&'static str]),
}

/// SQL rendering template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    /// `name(args...)`
    Call(&'static str),
    /// `name(arg0::text, args...)`
    TextCall(&'static str),
    /// `round(arg0::numeric, args...)`
    NumericCall(&'static str),
    CountAll,
    CountDistinct,
    /// md5 over the JSON array of every allowed column
    RowHash,
}

#[derive(Debug, Clone, Copy)]
pub struct FunctionDef {
    pub name: &'static str,
    pub class: FunctionClass,
    pub template: Template,
    /// Required arguments, in order
    pub args: &'static [ArgKind],
    /// Trailing optional arguments
    pub optional: &'static [ArgKind],
    /// Repeat the last required argument kind without bound
    pub variadic: bool,
}

const DATE_UNITS: &[&str] = &[
    "microseconds",
    "milliseconds",
    "second",
    "minute",
    "hour",
    "day",
    "week",
    "month",
    "quarter",
    "year",
    "decade",
    "century",
    "millennium",
];

const DATE_PARTS: &[&str] = &[
    "century", "day", "decade", "dow", "doy", "epoch", "hour", "isodow", "isoyear",
    "microseconds", "millennium", "milliseconds", "minute", "month", "quarter", "second",
    "timezone", "week", "year",
];

const fn def(
    name: &'static str,
    class: FunctionClass,
    template: Template,
    args: &'static [ArgKind],
) -> FunctionDef {
    FunctionDef {
        name,
        class,
        template,
        args,
        optional: &[],
        variadic: false,
    }
}

use ArgKind::*;
use FunctionClass::*;

static REGISTRY: &[FunctionDef] = &[
    // aggregations
    def("$count", Aggregation, Template::Call("count"), &[Column]),
    def("$countAll", Aggregation, Template::CountAll, &[]),
    def("$countDistinct", Aggregation, Template::CountDistinct, &[Column]),
    def("$sum", Aggregation, Template::Call("sum"), &[Column]),
    def("$avg", Aggregation, Template::Call("avg"), &[Column]),
    def("$min", Aggregation, Template::Call("min"), &[Column]),
    def("$max", Aggregation, Template::Call("max"), &[Column]),
    def("$array_agg", Aggregation, Template::Call("array_agg"), &[Column]),
    def("$json_agg", Aggregation, Template::Call("json_agg"), &[Column]),
    def("$string_agg", Aggregation, Template::TextCall("string_agg"), &[Column, Text]),
    // text
    def("$upper", Scalar, Template::TextCall("upper"), &[Column]),
    def("$lower", Scalar, Template::TextCall("lower"), &[Column]),
    def("$length", Scalar, Template::TextCall("length"), &[Column]),
    def("$trim", Scalar, Template::TextCall("trim"), &[Column]),
    def("$left", Scalar, Template::TextCall("left"), &[Column, Integer]),
    def("$right", Scalar, Template::TextCall("right"), &[Column, Integer]),
    def("$reverse", Scalar, Template::TextCall("reverse"), &[Column]),
    def("$md5", Scalar, Template::TextCall("md5"), &[Column]),
    FunctionDef {
        variadic: true,
        ..def("$concat", Scalar, Template::Call("concat"), &[ColumnOrText])
    },
    def("$coalesce", Scalar, Template::Call("coalesce"), &[Column, Literal]),
    // numeric
    FunctionDef {
        optional: &[Integer],
        ..def("$round", Scalar, Template::NumericCall("round"), &[Column])
    },
    def("$ceil", Scalar, Template::Call("ceil"), &[Column]),
    def("$floor", Scalar, Template::Call("floor"), &[Column]),
    def("$abs", Scalar, Template::Call("abs"), &[Column]),
    // dates
    def("$date_trunc", Scalar, Template::Call("date_trunc"), &[Keyword(DATE_UNITS), Column]),
    def("$date_part", Scalar, Template::Call("date_part"), &[Keyword(DATE_PARTS), Column]),
    def("$to_char", Scalar, Template::Call("to_char"), &[Column, Text]),
    FunctionDef {
        optional: &[Column],
        ..def("$age", Scalar, Template::Call("age"), &[Column])
    },
    // geometry
    def("$ST_AsGeoJSON", Scalar, Template::Call("ST_AsGeoJSON"), &[Column]),
    def("$ST_AsText", Scalar, Template::Call("ST_AsText"), &[Column]),
    // computed
    def("$rowhash", Computed, Template::RowHash, &[]),
];

pub fn lookup(name: &str) -> Option<&'static FunctionDef> {
    REGISTRY.iter().find(|f| f.name == name)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|f| f.name)
}

impl FunctionDef {
    /// Expected kind of the argument at `index`, or `None` past the end
    pub fn arg_kind(&self, index: usize) -> Option<ArgKind> {
        if let Some(kind) = self.args.get(index) {
            return Some(*kind);
        }
        if self.variadic {
            return self.args.last().copied();
        }
        self.optional.get(index - self.args.len()).copied()
    }

    pub fn accepts_count(&self, count: usize) -> bool {
        let min = self.args.len();
        if self.variadic {
            count >= min
        } else {
            (min..=min + self.optional.len()).contains(&count)
        }
    }

    /// Render with already-rendered argument SQL
    pub fn render(&self, args: &[String]) -> String {
        match self.template {
            Template::Call(name) => format!("{name}({})", args.join(", ")),
            Template::TextCall(name) => {
                let mut parts = args.to_vec();
                if let Some(first) = parts.first_mut() {
                    *first = format!("{first}::text");
                }
                format!("{name}({})", parts.join(", "))
            }
            Template::NumericCall(name) => {
                let mut parts = args.to_vec();
                if let Some(first) = parts.first_mut() {
                    *first = format!("{first}::numeric");
                }
                format!("{name}({})", parts.join(", "))
            }
            Template::CountAll => "count(*)".to_string(),
            Template::CountDistinct => format!("count(DISTINCT {})", args.join(", ")),
            Template::RowHash => format!("md5(json_build_array({})::text)", args.join(", ")),
        }
    }
}

/// Whether a JSON argument has the shape `kind` expects
pub fn literal_fits(kind: ArgKind, value: &Value) -> bool {
    match kind {
        ArgKind::Integer => value.as_i64().is_some(),
        ArgKind::Text => value.is_string(),
        ArgKind::Literal => !value.is_array() && !value.is_object(),
        ArgKind::Keyword(allowed) => value.as_str().is_some_and(|s| allowed.contains(&s)),
        ArgKind::Column | ArgKind::ColumnOrText => value.is_string(),
    }
}
