pub mod ledger;
pub mod llm;
pub mod pricing;
pub mod usage_governor;

pub use llm::{
    AnthropicProvider, Completion, CompletionRequest, LlmError, LlmProvider,
    MockProvider as LlmMockProvider,
};

pub use ledger::{LedgerEntry, LedgerError, LedgerStore};
pub use pricing::{default_pricing_table, ModelPricing, RateTable};
pub use usage_governor::{
    BudgetDenied, BudgetLimits, Clock, ManualClock, Reservation, Scope, ScopeLimit, SystemClock,
    UsageCharge, UsageEstimate, UsageEvent, UsageGovernor, UsageStatus, UsageSummary,
};
