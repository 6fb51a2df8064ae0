//! Code for reporting how long each phase of linking takes when the --time argument is supplied.

use std::time::Instant;
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

struct TimingLayer;

struct Data {
    start: Instant,
}

impl<S> Layer<S> for TimingLayer
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    fn max_level_hint(&self) -> Option<tracing::level_filters::LevelFilter> {
        Some(tracing::level_filters::LevelFilter::INFO)
    }

    fn on_new_span(&self, _attributes: &span::Attributes, id: &span::Id, ctx: Context<S>) {
        let span = ctx.span(id).expect("valid span ID");
        span.extensions_mut().insert(Data {
            start: Instant::now(),
        });
    }

    fn on_close(&self, id: span::Id, ctx: Context<S>) {
        let span = ctx.span(&id).expect("valid span ID");
        let Some(data) = span.extensions().get::<Data>().map(|d| d.start) else {
            return;
        };
        let scope_depth = span.scope().count() - 1;
        let wall = data.elapsed();
        let name = span.metadata().name();
        let ms = wall.as_secs_f64() * 1000.0;
        for _ in 0..scope_depth {
            print!("│ ");
        }
        println!("{ms:>8.2} {name}");
    }
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::registry().with(TimingLayer).try_init();
}
