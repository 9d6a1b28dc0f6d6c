//! Handler Configuration Resolver (C5): validates and normalizes a handler's
//! declared options before the runtime spawns its agent.

use std::collections::HashMap;

use serde_json::Value as Json;

use crate::error::ConfigError;
use crate::event::{StartFrom, StreamFilter};
use crate::handler::Callbacks;
use crate::registry::Consistency;

/// Caller-supplied option bag, as declared at the handler's call site —
/// possibly partial, possibly carrying keys this runtime does not
/// recognize.
#[derive(Debug, Clone, Default)]
pub struct RawHandlerOptions {
    /// Application this handler belongs to. Required.
    pub application: Option<String>,
    /// Durable handler name. Required, non-empty once normalized.
    pub name: Option<String>,
    /// Where to begin reading if no durable cursor exists yet. Defaults to
    /// [`StartFrom::Origin`].
    pub start_from: Option<StartFrom>,
    /// Which stream(s) to observe. Defaults to [`StreamFilter::All`].
    pub subscribe_to: Option<StreamFilter>,
    /// Read-your-writes strength. Defaults to the process-wide default
    /// passed to [`resolve`], falling back to [`Consistency::Eventual`].
    pub consistency: Option<Consistency>,
    /// Any additional keys the caller supplied, carried through so a
    /// misspelled or unsupported option can be reported by name rather than
    /// silently dropped.
    pub extra: HashMap<String, Json>,
}

/// Validated, defaulted configuration a handler runs with for its entire
/// lifetime. Constructing one outside [`resolve`] is only possible within
/// this crate, so every `HandlerOptions` in circulation has passed
/// validation.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Application this handler belongs to.
    pub application: String,
    /// Durable handler name.
    pub name: String,
    /// Where to begin reading if no durable cursor exists yet.
    pub start_from: StartFrom,
    /// Which stream(s) to observe.
    pub subscribe_to: StreamFilter,
    /// Read-your-writes strength.
    pub consistency: Consistency,
}

/// Resolves `raw` into a validated [`HandlerOptions`], using
/// `default_consistency` (a process-wide setting) when the caller didn't
/// pin one down explicitly.
///
/// Calls `callbacks`' `init_config` hook on the merged bag first, then
/// enforces the required fields against whatever it returns — a handler
/// that doesn't override `init_config` sees its bag enforced unchanged.
///
/// Fails fast — construction is rejected outright rather than starting a
/// handler with options it will only discover are broken once it tries to
/// subscribe.
pub async fn resolve<C, Event>(raw: RawHandlerOptions, default_consistency: Consistency, callbacks: &C) -> Result<HandlerOptions, ConfigError>
where
    C: Callbacks<Event>,
{
    let raw = callbacks.init_config(raw).await;

    if !raw.extra.is_empty() {
        let mut keys: Vec<String> = raw.extra.keys().cloned().collect();
        keys.sort();
        return Err(ConfigError::UnrecognizedOptions(keys));
    }

    let application = raw.application.filter(|s| !s.is_empty()).ok_or(ConfigError::MissingApplication)?;

    let name = raw.name.filter(|s| !s.trim().is_empty()).ok_or(ConfigError::MissingName)?;

    Ok(HandlerOptions {
        application,
        name,
        start_from: raw.start_from.unwrap_or_default(),
        subscribe_to: raw.subscribe_to.unwrap_or_default(),
        consistency: raw.consistency.unwrap_or(default_consistency),
    })
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use async_trait::async_trait;

    use super::*;

    /// Exercises `resolve` against a handler that doesn't override
    /// `init_config`, i.e. the default pass-through.
    struct Noop;

    #[async_trait]
    impl Callbacks<()> for Noop {
        type Error = Infallible;
    }

    /// Exercises `resolve` against a handler that overrides `init_config`
    /// to derive its own name from the account it was told to watch.
    struct DerivesNameFromAccount;

    #[async_trait]
    impl Callbacks<()> for DerivesNameFromAccount {
        type Error = Infallible;

        async fn init_config(&self, mut options: RawHandlerOptions) -> RawHandlerOptions {
            if let Some(Json::String(account)) = options.extra.remove("account") {
                options.name = Some(format!("balance-projector-{account}"));
            }
            options
        }
    }

    fn valid() -> RawHandlerOptions {
        RawHandlerOptions {
            application: Some("bank".to_string()),
            name: Some("balance-projector".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolves_with_defaults_applied() {
        let resolved = resolve(valid(), Consistency::Eventual, &Noop).await.unwrap();
        assert_eq!(resolved.application, "bank");
        assert_eq!(resolved.name, "balance-projector");
        assert_eq!(resolved.start_from, StartFrom::Origin);
        assert_eq!(resolved.subscribe_to, StreamFilter::All);
        assert_eq!(resolved.consistency, Consistency::Eventual);
    }

    #[tokio::test]
    async fn process_wide_default_consistency_is_used_when_unset() {
        let resolved = resolve(valid(), Consistency::Strong, &Noop).await.unwrap();
        assert_eq!(resolved.consistency, Consistency::Strong);
    }

    #[tokio::test]
    async fn explicit_consistency_overrides_the_process_wide_default() {
        let mut raw = valid();
        raw.consistency = Some(Consistency::Strong);
        let resolved = resolve(raw, Consistency::Eventual, &Noop).await.unwrap();
        assert_eq!(resolved.consistency, Consistency::Strong);
    }

    #[tokio::test]
    async fn missing_application_is_rejected() {
        let mut raw = valid();
        raw.application = None;
        assert_eq!(resolve(raw, Consistency::Eventual, &Noop).await.unwrap_err(), ConfigError::MissingApplication);
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let mut raw = valid();
        raw.name = Some("   ".to_string());
        assert_eq!(resolve(raw, Consistency::Eventual, &Noop).await.unwrap_err(), ConfigError::MissingName);
    }

    #[tokio::test]
    async fn unrecognized_options_are_reported_by_key() {
        let mut raw = valid();
        raw.extra.insert("retry_limit".to_string(), serde_json::json!(3));
        match resolve(raw, Consistency::Eventual, &Noop).await.unwrap_err() {
            ConfigError::UnrecognizedOptions(keys) => assert_eq!(keys, vec!["retry_limit".to_string()]),
            other => panic!("expected UnrecognizedOptions, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn init_config_hook_runs_before_enforcement() {
        let mut raw = RawHandlerOptions {
            application: Some("bank".to_string()),
            ..Default::default()
        };
        raw.extra.insert("account".to_string(), serde_json::json!("acc-1"));

        let resolved = resolve(raw, Consistency::Eventual, &DerivesNameFromAccount).await.unwrap();
        assert_eq!(resolved.name, "balance-projector-acc-1");
    }
}
