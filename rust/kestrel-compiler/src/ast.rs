//! Typed, scoped syntax tree consumed by the code generator.
//!
//! This is the output contract of semantic analysis: every expression carries
//! its resolved [`TypeId`], every variable reference is a resolved
//! [`VarAddress`], and every lexical block lists the symbols it declares.

use kestrel_core::{Constant, IntrinsicId, SymbolKind, TypeId, TypeTable};

/// Resolved reference to a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarAddress {
    /// `index` in the block `parent_steps` levels out from the current one.
    Scope { parent_steps: u32, index: u32 },
    /// Symbol of the global frame.
    Global(u32),
    /// A built-in function used as a value.
    Intrinsic(IntrinsicId),
}

/// A symbol declared by a block.
///
/// An `any` parameter occupies two parameter symbols: its runtime type id
/// (`typeid`) immediately followed by the value itself (`any`).
#[derive(Debug, Clone, PartialEq)]
pub struct AstSymbol {
    pub name: String,
    pub ty: TypeId,
    pub kind: SymbolKind,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Body {
    pub symbols: Vec<AstSymbol>,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    /// `start ... end`
    Closed,
    /// `start ..< end`
    Open,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Initialise a freshly declared symbol.
    Bind { dest: VarAddress, value: Expression },
    /// Assign to an existing mutable symbol.
    Store { dest: VarAddress, value: Expression },
    Block(Body),
    Return(Expression),
    If {
        condition: Expression,
        then_body: Body,
        else_body: Option<Body>,
    },
    /// The loop counter is symbol 0 of `body`.
    For {
        range: RangeKind,
        start: Expression,
        end: Expression,
        body: Body,
    },
    While { condition: Expression, body: Body },
    Expression(Expression),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Smaller,
    SmallerOrEqual,
    Larger,
    LargerOrEqual,
    Equal,
    NotEqual,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub ty: TypeId,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Constant),
    Load(VarAddress),
    Member {
        parent: Box<Expression>,
        index: u32,
    },
    Lookup {
        parent: Box<Expression>,
        key: Box<Expression>,
    },
    Call {
        callee: Box<Expression>,
        args: Vec<Expression>,
    },
    IntrinsicCall {
        id: IntrinsicId,
        args: Vec<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Conditional {
        condition: Box<Expression>,
        then_expr: Box<Expression>,
        else_expr: Box<Expression>,
    },
    /// Vector, dict or struct built from `args`. Dict arguments alternate
    /// key and value.
    ConstructValue { args: Vec<Expression> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    /// Host symbol for body-less functions. Defaults to `name`.
    pub linkage_name: Option<String>,
    pub signature: TypeId,
    /// `None` for functions implemented by the host.
    pub body: Option<Body>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessDecl {
    pub name: String,
    pub init: String,
    pub handler: String,
    pub state_type: TypeId,
    pub message_type: TypeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDecl {
    pub name: String,
    pub processes: Vec<ProcessDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestDecl {
    pub module: String,
    pub name: String,
    pub function: String,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub globals: Body,
    pub functions: Vec<FunctionDef>,
    pub types: TypeTable,
    pub container: Option<ContainerDecl>,
    pub tests: Vec<TestDecl>,
}

impl Program {
    pub fn new(types: TypeTable) -> Self {
        Self {
            globals: Body::default(),
            functions: Vec::new(),
            types,
            container: None,
            tests: Vec::new(),
        }
    }
}

/// Helpers for assembling trees by hand.
pub mod build {
    use super::*;
    use kestrel_core::FunctionId;

    pub fn scope(parent_steps: u32, index: u32) -> VarAddress {
        VarAddress::Scope {
            parent_steps,
            index,
        }
    }

    pub fn sym(name: &str, ty: TypeId, kind: SymbolKind) -> AstSymbol {
        AstSymbol {
            name: name.to_string(),
            ty,
            kind,
        }
    }

    pub fn param(name: &str, ty: TypeId) -> AstSymbol {
        sym(name, ty, SymbolKind::Parameter)
    }

    pub fn var(name: &str, ty: TypeId) -> AstSymbol {
        sym(name, ty, SymbolKind::Mutable)
    }

    pub fn immutable(name: &str, ty: TypeId) -> AstSymbol {
        sym(name, ty, SymbolKind::Immutable)
    }

    pub fn body(symbols: Vec<AstSymbol>, statements: Vec<Statement>) -> Body {
        Body {
            symbols,
            statements,
        }
    }

    pub fn literal(ty: TypeId, c: Constant) -> Expression {
        Expression {
            ty,
            kind: ExprKind::Literal(c),
        }
    }

    pub fn int(n: i64) -> Expression {
        literal(TypeId::INT, Constant::Int(n))
    }

    pub fn double(d: f64) -> Expression {
        literal(TypeId::DOUBLE, Constant::Double(d))
    }

    pub fn boolean(b: bool) -> Expression {
        literal(TypeId::BOOL, Constant::Bool(b))
    }

    pub fn string(s: &str) -> Expression {
        literal(TypeId::STRING, Constant::String(s.to_string()))
    }

    pub fn json(j: serde_json::Value) -> Expression {
        literal(TypeId::JSON, Constant::Json(j))
    }

    pub fn type_literal(t: TypeId) -> Expression {
        literal(TypeId::TYPEID, Constant::TypeId(t))
    }

    pub fn function(index: u32, signature: TypeId) -> Expression {
        literal(signature, Constant::Function(FunctionId::Defined(index)))
    }

    pub fn load(addr: VarAddress, ty: TypeId) -> Expression {
        Expression {
            ty,
            kind: ExprKind::Load(addr),
        }
    }

    pub fn local(parent_steps: u32, index: u32, ty: TypeId) -> Expression {
        load(scope(parent_steps, index), ty)
    }

    pub fn global(index: u32, ty: TypeId) -> Expression {
        load(VarAddress::Global(index), ty)
    }

    pub fn member(parent: Expression, index: u32, ty: TypeId) -> Expression {
        Expression {
            ty,
            kind: ExprKind::Member {
                parent: Box::new(parent),
                index,
            },
        }
    }

    pub fn lookup(parent: Expression, key: Expression, ty: TypeId) -> Expression {
        Expression {
            ty,
            kind: ExprKind::Lookup {
                parent: Box::new(parent),
                key: Box::new(key),
            },
        }
    }

    pub fn call(callee: Expression, args: Vec<Expression>, ret: TypeId) -> Expression {
        Expression {
            ty: ret,
            kind: ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
        }
    }

    pub fn intrinsic(id: IntrinsicId, args: Vec<Expression>, ret: TypeId) -> Expression {
        Expression {
            ty: ret,
            kind: ExprKind::IntrinsicCall { id, args },
        }
    }

    pub fn unary(op: UnaryOp, operand: Expression) -> Expression {
        Expression {
            ty: operand.ty,
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        }
    }

    /// Binary expression. Comparisons and logical operators yield `bool`,
    /// arithmetic yields the left operand's type.
    pub fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Expression {
        let ty = match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => lhs.ty,
            _ => TypeId::BOOL,
        };
        Expression {
            ty,
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        }
    }

    pub fn add(lhs: Expression, rhs: Expression) -> Expression {
        binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: Expression, rhs: Expression) -> Expression {
        binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn conditional(condition: Expression, then_expr: Expression, else_expr: Expression) -> Expression {
        Expression {
            ty: then_expr.ty,
            kind: ExprKind::Conditional {
                condition: Box::new(condition),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
        }
    }

    pub fn construct(ty: TypeId, args: Vec<Expression>) -> Expression {
        Expression {
            ty,
            kind: ExprKind::ConstructValue { args },
        }
    }

    pub fn bind(dest: VarAddress, value: Expression) -> Statement {
        Statement::Bind { dest, value }
    }

    pub fn store(dest: VarAddress, value: Expression) -> Statement {
        Statement::Store { dest, value }
    }

    pub fn ret(value: Expression) -> Statement {
        Statement::Return(value)
    }

    pub fn expr(value: Expression) -> Statement {
        Statement::Expression(value)
    }

    pub fn block(body: Body) -> Statement {
        Statement::Block(body)
    }

    pub fn if_else(condition: Expression, then_body: Body, else_body: Option<Body>) -> Statement {
        Statement::If {
            condition,
            then_body,
            else_body,
        }
    }

    pub fn for_range(range: RangeKind, start: Expression, end: Expression, body: Body) -> Statement {
        Statement::For {
            range,
            start,
            end,
            body,
        }
    }

    pub fn while_loop(condition: Expression, body: Body) -> Statement {
        Statement::While { condition, body }
    }

    pub fn print(value: Expression) -> Statement {
        expr(intrinsic(IntrinsicId::Print, vec![value], TypeId::VOID))
    }

    pub fn function_def(name: &str, signature: TypeId, body: Option<Body>) -> FunctionDef {
        FunctionDef {
            name: name.to_string(),
            linkage_name: None,
            signature,
            body,
        }
    }
}
