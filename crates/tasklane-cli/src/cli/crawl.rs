//! Simulated crawl: one task per page, child pages spawned into the same
//! context, and a report task that waits for the last page.
//!
//! Each page task runs three steps:
//! 1. `fetch`: a bounded retry over a flaky simulated fetch.
//! 2. `extract`: headers and links extracted in parallel.
//! 3. `enqueue`: child pages queued into the context, page recorded as a
//!    shared attribute.
//!
//! The `report` task is parked on the `crawl.done` attribute. An event
//! listener counts finished pages, failed ones included, and wakes the
//! report with a targeted resume once none are left.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::{json, Value};
use tasklane_core::event::EventBus;
use tasklane_core::{work, RetryPolicy, StepHandle, Task, TaskContext};
use tasklane_infra::executor::executor_from_config;
use tasklane_types::config::EngineConfig;
use tasklane_types::event::TaskEvent;
use tasklane_types::status::{ContextStatus, TaskStatus};
use tasklane_types::summary::ContextSummary;

const DONE_ATTR: &str = "crawl.done";
const REPORT_TASK: &str = "report";
const PAGE_PREFIX: &str = "page:";
/// Roughly four events per page; sized so the listener never lags on
/// realistic crawls.
const EVENT_CAPACITY: usize = 16 * 1024;

/// Crawl shape chosen on the command line.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub seeds: usize,
    pub depth: u32,
    pub fanout: usize,
    pub flaky_every: u64,
    pub parallel: Option<usize>,
    /// Fail a page whose fetch is still timing out after the last retry,
    /// instead of keeping the empty result.
    pub strict: bool,
}

/// What a finished crawl reports.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub summary: ContextSummary,
    pub pages: usize,
    pub fetches: u64,
    pub retries: u64,
}

struct Crawl {
    max_depth: u32,
    fanout: usize,
    flaky_every: u64,
    policy: RetryPolicy,
    /// Pages queued or running. The finished page that takes it to zero
    /// wakes the report.
    outstanding: AtomicUsize,
    fetches: AtomicU64,
}

impl Crawl {
    fn is_flaky(&self, url: &str) -> bool {
        self.flaky_every > 0 && url.bytes().map(u64::from).sum::<u64>() % self.flaky_every == 0
    }

    async fn fetch(&self, url: &str, attempt: u32) -> Result<Value> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(1 + n % 5)).await;
        if attempt == 1 && self.is_flaky(url) {
            tracing::debug!(%url, "simulated fetch timeout");
            return Ok(Value::Null);
        }
        Ok(json!({
            "url": url,
            "status": 200,
            "body": format!("<html><title>{url}</title></html>"),
        }))
    }

    fn links(&self, url: &str, depth: u32) -> Vec<String> {
        if depth >= self.max_depth {
            return Vec::new();
        }
        (0..self.fanout).map(|i| format!("{url}/{i}")).collect()
    }

    fn enqueue(self: &Arc<Self>, url: &str, depth: u32, joined: Value, me: &StepHandle) -> Result<Value> {
        let ctx = me
            .context()
            .with_context(|| format!("page {url} is not running in a context"))?;
        let links: Vec<String> = joined
            .get(1)
            .and_then(Value::as_array)
            .map(|links| {
                links
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut queued = 0;
        for link in links {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            match ctx.add_task(page_task(self, link, depth + 1)) {
                Ok(()) => queued += 1,
                Err(err) => {
                    self.outstanding.fetch_sub(1, Ordering::SeqCst);
                    tracing::warn!(error = %err, "child page not queued");
                }
            }
        }

        me.set_attr(me.task().key(), joined.get(0).cloned().unwrap_or_default());
        Ok(json!({ "url": url, "queued": queued }))
    }

    /// Count one page as done, whatever its outcome.
    fn page_finished(&self, page: &str, status: TaskStatus, ctx: &TaskContext) {
        if status == TaskStatus::FailStopped {
            tracing::warn!(%page, "page failed");
        }
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            tracing::info!(%page, "last page finished, waking report");
            ctx.set_attr(DONE_ATTR, true);
            ctx.resume_task(REPORT_TASK);
        }
    }
}

fn page_task(crawl: &Arc<Crawl>, url: String, depth: u32) -> Task {
    let (fetcher, fetch_url) = (Arc::clone(crawl), url.clone());
    let (linker, link_url) = (Arc::clone(crawl), url.clone());
    let (spawner, page_url) = (Arc::clone(crawl), url.clone());

    Task::builder(format!("{PAGE_PREFIX}{url}"))
        .input(json!(url))
        .re_step_with(crawl.policy.clone(), None, move |_, me| {
            let (crawl, url) = (Arc::clone(&fetcher), fetch_url.clone());
            async move { crawl.fetch(&url, me.times()).await }
        })
        .named("fetch")
        .parallel(vec![
            work(|page, _| async move {
                let length = page["body"].as_str().map_or(0, str::len);
                Ok(json!({ "content_type": "text/html", "length": length }))
            }),
            work(move |_, _| {
                let (crawl, url) = (Arc::clone(&linker), link_url.clone());
                async move { Ok(json!(crawl.links(&url, depth))) }
            }),
        ])
        .named("extract")
        .step(move |joined, me| {
            let (crawl, url) = (Arc::clone(&spawner), page_url.clone());
            async move { crawl.enqueue(&url, depth, joined, &me) }
        })
        .named("enqueue")
        .build()
}

fn report_task() -> Task {
    Task::builder(REPORT_TASK)
        .step_when(
            |me: &StepHandle| me.get_attr(DONE_ATTR).is_some(),
            |_, me| async move {
                let ctx = me.context().context("report task is not running in a context")?;
                let pages = count_pages(&ctx);
                tracing::info!(pages, "crawl report ready");
                Ok(json!({ "pages": pages }))
            },
        )
        .named("summarize")
        .build()
}

fn count_pages(ctx: &TaskContext) -> usize {
    ctx.attr_keys()
        .iter()
        .filter(|k| k.starts_with(PAGE_PREFIX))
        .count()
}

/// Run a crawl to completion and collect its report.
pub async fn crawl(config: &EngineConfig, options: &CrawlOptions) -> Result<CrawlReport> {
    let mut context_config = config.context.clone();
    if let Some(limit) = options.parallel {
        context_config.parallel_limit = limit;
    }
    if context_config.parallel_limit < 2 {
        tracing::warn!(
            configured = context_config.parallel_limit,
            "crawl needs a slot for the report task, raising parallel limit to 2"
        );
        context_config.parallel_limit = 2;
    }

    let (executor, dedicated) =
        executor_from_config(&config.executor).context("failed to build executor")?;
    let events = EventBus::new(EVENT_CAPACITY);
    let ctx = TaskContext::builder("crawl")
        .config(&context_config)
        .executor(executor)
        .owns_executor(dedicated)
        .event_bus(events.clone())
        .build();
    let mut rx = events.subscribe_context(ctx.key());

    let mut policy = RetryPolicy::from_config(&config.retry, |result, _| result.is_null());
    if options.strict {
        policy = policy.fail_when_exhausted();
    }
    let crawl = Arc::new(Crawl {
        max_depth: options.depth,
        fanout: options.fanout,
        flaky_every: options.flaky_every,
        policy,
        outstanding: AtomicUsize::new(options.seeds),
        fetches: AtomicU64::new(0),
    });

    ctx.add_task(report_task())?;
    if options.seeds == 0 {
        ctx.set_attr(DONE_ATTR, true);
    }
    for i in 0..options.seeds {
        ctx.add_task(page_task(&crawl, format!("https://site-{i}.test"), 0))?;
    }

    let listener = {
        let (ctx, crawl) = (ctx.clone(), Arc::clone(&crawl));
        tokio::spawn(async move {
            let mut retries = 0u64;
            while let Some(event) = rx.recv().await {
                match event {
                    TaskEvent::StepRetried { .. } => retries += 1,
                    TaskEvent::TaskFinished { task, status, .. } if task.starts_with(PAGE_PREFIX) => {
                        crawl.page_finished(&task, status, &ctx);
                    }
                    TaskEvent::ContextFinished { .. } => break,
                    _ => {}
                }
            }
            retries
        })
    };

    ctx.start();
    tokio::select! {
        _ = ctx.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, stopping crawl");
            ctx.set_attr(DONE_ATTR, true);
            ctx.stop();
            ctx.wait().await;
        }
    }

    Ok(CrawlReport {
        summary: ctx.summary(),
        pages: count_pages(&ctx),
        fetches: crawl.fetches.load(Ordering::SeqCst),
        retries: listener.await.unwrap_or_default(),
    })
}

/// `tasklane crawl`: run the crawl and print its report.
pub async fn run_crawl(config: &EngineConfig, options: &CrawlOptions, json: bool) -> Result<()> {
    let report = crawl(config, options).await?;

    if json {
        let out = json!({
            "summary": report.summary,
            "pages": report.pages,
            "fetches": report.fetches,
            "retries": report.retries,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let status_cell = match report.summary.status {
        ContextStatus::OkStopped => Cell::new("● ok").fg(Color::Green),
        ContextStatus::FailStopped => Cell::new("✗ failed").fg(Color::Red),
        other => Cell::new(other.to_string()).fg(Color::Yellow),
    };

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Metric").fg(Color::White),
        Cell::new("Value").fg(Color::White),
    ]);
    table.add_row(vec![Cell::new("Status"), status_cell]);
    let rows = [
        ("Pages", report.pages.to_string()),
        ("Fetch attempts", report.fetches.to_string()),
        ("Retries", report.retries.to_string()),
        ("Tasks succeeded", report.summary.succeeded.to_string()),
        ("Tasks failed", report.summary.failed.to_string()),
        ("Tasks discarded", report.summary.discarded.to_string()),
        ("Elapsed", format!("{} ms", report.summary.elapsed_ms)),
    ];
    for (metric, value) in rows {
        table.add_row(vec![Cell::new(metric), Cell::new(value).fg(Color::Cyan)]);
    }

    println!();
    println!(
        "  {} Crawl {}",
        style("⚡").bold(),
        style(&report.summary.key).cyan()
    );
    println!();
    println!("{table}");
    if !report.summary.timed_out.is_empty() {
        println!(
            "  {} timed out: {}",
            style("!").yellow().bold(),
            report.summary.timed_out.join(", ")
        );
    }
    println!();
    Ok(())
}
