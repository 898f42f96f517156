//! Ports - 抽象化レイヤー
//!
//! Traits the engine is written against. Concrete transports and
//! middlewares live in [`crate::impls`].

pub mod broker;
pub mod handler;
pub mod middleware;

pub use self::broker::{Broker, BrokerCore, BrokerExt, BrokerOptions, CancelPredicate, MessageSource};
pub use self::handler::{
    AsyncFnHandler, ErrorCallback, FnHandler, StepHandler, StepOutput, StepResult,
    async_handler_fn, handler_fn,
};
pub use self::middleware::{HookContext, HookResult, HookSignal, Middleware, MiddlewareChain, Phase};
