use boa_engine::{Context as JsContext, Source};
use tracing::warn;

use super::baseline::Baseline;
use super::types::FUZZY_STATUS;
use crate::errors::RsprayError;

/// The variable bag a predicate runs against: `index`, `random`,
/// `current` and one `bl<status>` per fuzzy status, each a JSON object of
/// the baseline's externally visible fields.
#[derive(Debug, Clone, Default)]
pub struct Bag {
    vars: Vec<(String, serde_json::Value)>,
}

impl Bag {
    pub fn set(&mut self, name: &str, bl: &Baseline) {
        let value = serde_json::to_value(bl).unwrap_or(serde_json::Value::Null);
        self.vars.push((name.to_string(), value));
    }
}

/// A bag where every variable is an empty baseline; used to validate
/// expressions at startup.
pub fn sentinel_bag() -> Bag {
    let empty = Baseline::default();
    let mut bag = Bag::default();
    bag.set("index", &empty);
    bag.set("random", &empty);
    bag.set("current", &empty);
    for status in FUZZY_STATUS {
        bag.set(&format!("bl{}", status), &empty);
    }
    bag
}

/// User-supplied match/filter/recurse predicates.
#[derive(Debug, Clone, Default)]
pub struct ExpressionSet {
    pub match_expr: Option<String>,
    pub filter_expr: Option<String>,
    pub recu_expr: Option<String>,
}

impl ExpressionSet {
    /// Validates every configured expression against a sentinel bag so
    /// syntax errors surface as configuration errors before the run.
    pub fn new(
        match_expr: Option<String>,
        filter_expr: Option<String>,
        recu_expr: Option<String>,
    ) -> Result<Self, RsprayError> {
        let set = Self {
            match_expr,
            filter_expr,
            recu_expr,
        };
        let bag = sentinel_bag();
        for expr in [&set.match_expr, &set.filter_expr, &set.recu_expr]
            .into_iter()
            .flatten()
        {
            check(expr, &bag)?;
        }
        Ok(set)
    }

    pub fn any(&self) -> bool {
        self.match_expr.is_some() || self.filter_expr.is_some() || self.recu_expr.is_some()
    }
}

fn install_vars(ctx: &mut JsContext, bag: &Bag) -> Result<(), String> {
    for (name, value) in &bag.vars {
        let script = format!("var {} = {};", name, value);
        ctx.eval(Source::from_bytes(&script))
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Evaluates one boolean predicate. Runtime errors are logged and count
/// as false, matching the engine's reject-by-default stance.
pub fn eval(expr: &str, bag: &Bag) -> bool {
    let mut ctx = JsContext::default();
    if let Err(e) = install_vars(&mut ctx, bag) {
        warn!("expression bag setup failed: {}", e);
        return false;
    }
    match ctx.eval(Source::from_bytes(expr)) {
        Ok(value) => value.as_boolean().unwrap_or(false),
        Err(e) => {
            warn!("expression '{}' failed: {}", expr, e);
            false
        }
    }
}

fn check(expr: &str, bag: &Bag) -> Result<(), RsprayError> {
    let mut ctx = JsContext::default();
    install_vars(&mut ctx, bag).map_err(|message| RsprayError::InvalidExpression {
        expr: expr.to_string(),
        message,
    })?;
    ctx.eval(Source::from_bytes(expr))
        .map(|_| ())
        .map_err(|e| RsprayError::InvalidExpression {
            expr: expr.to_string(),
            message: e.to_string(),
        })
}
