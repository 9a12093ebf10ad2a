use actix::prelude::*;
use futures::future::LocalBoxFuture;
use tracing::Span;

/// Message with span used for trace logging
pub struct SpanMessage<I> {
    pub msg: I,
    pub span: Span,
}

impl<M> SpanMessage<M> {
    pub fn new(msg: M) -> Self {
        Self {
            msg,
            span: Span::current(),
        }
    }
}

impl<M, R: 'static> Message for SpanMessage<M>
where
    M: Message<Result = R>,
{
    type Result = R;
}

/// Handler whose work runs as a future detached from the actor borrow. The
/// returned future is polled inside the sender's span.
pub trait AsyncSpanHandler<M>
where
    Self: Actor,
    M: Message,
{
    fn handle(&mut self, msg: M, ctx: &mut Self::Context) -> LocalBoxFuture<'static, M::Result>;
}

#[macro_export]
macro_rules! span_message_async_impl {
    ($message_type:ident, $actor:ident) => {
        impl actix::Handler<$crate::span::SpanMessage<$message_type>> for $actor {
            type Result = actix::ResponseFuture<<$message_type as actix::Message>::Result>;

            fn handle(
                &mut self,
                msg: $crate::span::SpanMessage<$message_type>,
                ctx: &mut <$actor as actix::Actor>::Context,
            ) -> Self::Result {
                use tracing_futures::Instrument;
                let $crate::span::SpanMessage { span, msg } = msg;
                let fut = {
                    let _enter = span.enter();
                    tracing::trace!("Running wrapped span message handler");
                    <Self as $crate::span::AsyncSpanHandler<$message_type>>::handle(self, msg, ctx)
                };
                Box::pin(fut.instrument(span))
            }
        }
    };
}

#[macro_export]
macro_rules! async_message_handler_with_span {
    (impl AsyncSpanHandler<$M:ident> for $A:ident $t:tt) => {
        $crate::span_message_async_impl!($M, $A);
        impl $crate::span::AsyncSpanHandler<$M> for $A
            $t
    };
}
