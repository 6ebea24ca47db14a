//! Scalar function plugin contract and the built-in LLM functions.
//!
//! A function attaches to the engine as an explicit `(name, signature,
//! return type, body)` tuple; the name is supplied by the caller, never
//! inferred from the callable. Bodies are row-wise: they receive one
//! `ScalarValue` per argument and produce the row's result. Null handling and
//! error policy live in the engine adapter, not in the bodies, so a body can
//! assume its inputs are non-null.

use std::fmt;
use std::sync::Arc;

use anyhow::bail;
use datafusion::arrow::datatypes::DataType;
use datafusion::logical_expr::{Signature, TypeSignature, Volatility};
use datafusion::scalar::ScalarValue;

use crate::llm::LlmClient;

pub type ScalarFnBody =
    Arc<dyn Fn(&[ScalarValue]) -> anyhow::Result<ScalarValue> + Send + Sync>;

pub struct FunctionSpec {
    name: String,
    signature: Signature,
    return_type: DataType,
    body: ScalarFnBody,
}

impl FunctionSpec {
    /// A function accepting exactly `args`, registered under `name`
    /// (lowercased, matching how the engine resolves unquoted calls).
    pub fn new(
        name: impl Into<String>,
        args: Vec<DataType>,
        return_type: DataType,
        body: impl Fn(&[ScalarValue]) -> anyhow::Result<ScalarValue> + Send + Sync + 'static,
    ) -> Self {
        Self::with_signature(
            name,
            Signature::exact(args, Volatility::Volatile),
            return_type,
            body,
        )
    }

    pub fn with_signature(
        name: impl Into<String>,
        signature: Signature,
        return_type: DataType,
        body: impl Fn(&[ScalarValue]) -> anyhow::Result<ScalarValue> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into().to_lowercase(),
            signature,
            return_type,
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn signature(&self) -> &Signature {
        &self.signature
    }

    pub(crate) fn return_type(&self) -> &DataType {
        &self.return_type
    }

    pub(crate) fn body(&self) -> ScalarFnBody {
        Arc::clone(&self.body)
    }
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .finish()
    }
}

pub(crate) const SENTIMENT_PROMPT: &str = "Classify the sentiment expressed in the following \
     text. The output should be one of 'positive', 'negative' or 'neutral'.";

/// `ai(text [, system_prompt]) -> text`: one completion request per distinct
/// input, memoized by the runner's client.
pub fn ai(client: Arc<dyn LlmClient>) -> FunctionSpec {
    FunctionSpec::with_signature(
        "ai",
        Signature::one_of(
            vec![TypeSignature::String(1), TypeSignature::String(2)],
            Volatility::Volatile,
        ),
        DataType::Utf8,
        move |args| {
            let text = text_arg(&args[0])?;
            let system = match args.get(1) {
                Some(value) => Some(text_arg(value)?),
                None => None,
            };
            Ok(ScalarValue::Utf8(client.complete(system, text)?))
        },
    )
}

/// `sentiment(text) -> text`: completion with a fixed classifying
/// instruction; answers are one of `positive`, `negative`, `neutral`.
pub fn sentiment(client: Arc<dyn LlmClient>) -> FunctionSpec {
    FunctionSpec::with_signature(
        "sentiment",
        Signature::one_of(vec![TypeSignature::String(1)], Volatility::Volatile),
        DataType::Utf8,
        move |args| {
            let text = text_arg(&args[0])?;
            Ok(ScalarValue::Utf8(
                client.complete(Some(SENTIMENT_PROMPT), text)?,
            ))
        },
    )
}

fn text_arg(value: &ScalarValue) -> anyhow::Result<&str> {
    match value {
        ScalarValue::Utf8(Some(text))
        | ScalarValue::LargeUtf8(Some(text))
        | ScalarValue::Utf8View(Some(text)) => Ok(text),
        other => bail!("expected a string argument, got {other:?}"),
    }
}
