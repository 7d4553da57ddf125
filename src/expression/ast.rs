// ABOUTME: Abstract syntax tree for workflow expressions
// ABOUTME: Restricted to literals, roots, member access, whitelisted calls and operators

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    /// A `$`-prefixed data root such as `$json`
    Root(String),
    /// A bare name; only whitelisted functions and namespaces resolve
    Name(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
        }
    }
}

impl Expr {
    /// Render a member/index chain back to a readable path for error messages
    pub fn path(&self) -> String {
        match self {
            Expr::Root(name) => format!("${}", name),
            Expr::Name(name) => name.clone(),
            Expr::Member { object, property } => format!("{}.{}", object.path(), property),
            Expr::Index { object, index } => match index.as_ref() {
                Expr::Literal(Value::Number(n)) => format!("{}[{}]", object.path(), n),
                Expr::Literal(Value::String(s)) => format!("{}['{}']", object.path(), s),
                _ => format!("{}[..]", object.path()),
            },
            Expr::Call { callee, .. } => format!("{}(..)", callee.path()),
            _ => "<expression>".to_string(),
        }
    }
}
