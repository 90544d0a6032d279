use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use harvest_adapters::{CandidateElement, NavigationError, Navigator};
use harvest_core::{HarvestKind, HarvestMode, PRICING_NOT_FOUND, SIN_NOT_FOUND};
use harvest_storage::{Checkpointer, RecordStore};
use harvest_sync::{
    build_matcher, load_mapping, open_store, CandidateMatcher, HarvestConfig, HarvestEngine, Phase,
    RunSummary, ShutdownFlag,
};
use tempfile::tempdir;

#[derive(Debug, Clone, Default)]
struct Page {
    text: String,
    elements: Vec<CandidateElement>,
    more: Vec<Vec<CandidateElement>>,
}

/// In-memory navigator serving canned pages and recording every visit.
#[derive(Debug, Default)]
struct ScriptedNavigator {
    pages: HashMap<String, Page>,
    current: Option<Page>,
    visits: Vec<String>,
    fail_once: HashSet<String>,
    fail_always: HashSet<String>,
    time_out: HashSet<String>,
    interrupt_on: Option<(String, ShutdownFlag)>,
    unhealthy: bool,
    load_more_calls: usize,
    restarts: usize,
    closed: bool,
}

impl ScriptedNavigator {
    fn with_results(mut self, url: &str, elements: Vec<CandidateElement>) -> Self {
        self.pages.insert(
            url.to_string(),
            Page {
                text: String::new(),
                elements,
                more: Vec::new(),
            },
        );
        self
    }

    fn with_more(mut self, url: &str, more: Vec<Vec<CandidateElement>>) -> Self {
        self.pages.entry(url.to_string()).or_default().more = more;
        self
    }

    fn with_text(mut self, url: &str, text: &str) -> Self {
        self.pages.insert(
            url.to_string(),
            Page {
                text: text.to_string(),
                ..Page::default()
            },
        );
        self
    }
}

#[async_trait]
impl Navigator for ScriptedNavigator {
    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError> {
        self.visits.push(url.to_string());
        if let Some((trigger, flag)) = &self.interrupt_on {
            if trigger == url {
                flag.request();
            }
        }
        if self.fail_once.remove(url) || self.time_out.contains(url) {
            return Err(NavigationError::Timeout { url: url.to_string() });
        }
        if self.fail_always.contains(url) {
            return Err(NavigationError::Parse {
                url: url.to_string(),
                message: "unexpected markup".to_string(),
            });
        }
        self.current = Some(self.pages.get(url).cloned().unwrap_or_default());
        Ok(())
    }

    async fn rendered_text(&mut self) -> Result<String, NavigationError> {
        self.current
            .as_ref()
            .map(|p| p.text.clone())
            .ok_or(NavigationError::NoPage)
    }

    async fn candidate_elements(&mut self) -> Result<Vec<CandidateElement>, NavigationError> {
        self.current
            .as_ref()
            .map(|p| p.elements.clone())
            .ok_or(NavigationError::NoPage)
    }

    async fn load_more(&mut self) -> Result<bool, NavigationError> {
        self.load_more_calls += 1;
        let page = self.current.as_mut().ok_or(NavigationError::NoPage)?;
        if page.more.is_empty() {
            return Ok(false);
        }
        let next = page.more.remove(0);
        page.elements.extend(next);
        Ok(true)
    }

    async fn is_healthy(&mut self) -> bool {
        !self.closed && !self.unhealthy
    }

    async fn restart(&mut self) -> Result<(), NavigationError> {
        self.restarts += 1;
        self.current = None;
        self.closed = false;
        self.unhealthy = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), NavigationError> {
        self.closed = true;
        Ok(())
    }
}

fn product(
    manufacturer: &str,
    unit: &str,
    price: &str,
    contractor: &str,
    contract: &str,
) -> CandidateElement {
    CandidateElement::new(format!(
        "Mfr: {manufacturer}\n${price} {unit}\nContractor: {contractor}\nContract#: {contract}"
    ))
}

fn q(n: usize) -> String {
    format!("https://catalog.test/q/{n}")
}

struct Harness {
    config: HarvestConfig,
    checkpointer: Checkpointer,
    store: RecordStore,
    matcher: CandidateMatcher,
}

async fn write_store(dir: &Path, csv: &str) {
    tokio::fs::write(dir.join("catalog.csv"), csv).await.expect("write store");
}

async fn harness(dir: &Path, tune: impl FnOnce(&mut HarvestConfig)) -> Harness {
    let mut config = HarvestConfig {
        store: dir.join("catalog.csv"),
        mapping: dir.join("mapping.csv"),
        rate_limit: Duration::ZERO,
        ..HarvestConfig::default()
    };
    tune(&mut config);
    let (checkpointer, store) = open_store(&config).await.expect("open store");
    let mapping = load_mapping(&config, &store).await.expect("mapping");
    let matcher = build_matcher(&config, mapping).expect("matcher");
    Harness {
        config,
        checkpointer,
        store,
        matcher,
    }
}

async fn run_tuned(
    dir: &Path,
    navigator: ScriptedNavigator,
    mode: HarvestMode,
    tune: impl FnOnce(&mut HarvestConfig),
) -> (RunSummary, ScriptedNavigator, RecordStore) {
    let Harness {
        config,
        checkpointer,
        mut store,
        matcher,
    } = harness(dir, tune).await;
    let shutdown = ShutdownFlag::new();
    let mut engine = HarvestEngine::new(config, navigator, matcher, checkpointer, shutdown);
    let summary = engine.run(&mut store, &mode).await.expect("run");
    (summary, engine.into_navigator(), store)
}

async fn run(
    dir: &Path,
    navigator: ScriptedNavigator,
    mode: HarvestMode,
    shutdown: ShutdownFlag,
) -> (RunSummary, ScriptedNavigator, RecordStore) {
    let Harness {
        config,
        checkpointer,
        mut store,
        matcher,
    } = harness(dir, |_| {}).await;
    let mut engine = HarvestEngine::new(config, navigator, matcher, checkpointer, shutdown);
    let summary = engine.run(&mut store, &mode).await.expect("run");
    (summary, engine.into_navigator(), store)
}

async fn reload(dir: &Path) -> RecordStore {
    let bytes = tokio::fs::read(dir.join("catalog.csv")).await.expect("read store");
    RecordStore::from_csv_bytes(&bytes).expect("parse store")
}

const TWO_ROWS: &str = "\
Item Number,Manufacturer,Unit of Measure,Links
A-1,Avery,EA,https://catalog.test/q/1
A-2,Avery,EA,https://catalog.test/q/2
";

fn avery_results() -> Vec<CandidateElement> {
    vec![
        product("Avery", "EA", "4.50", "Acme Office", "GS-07F-0001"),
        product("Quartet", "EA", "3.10", "Zeta Supply", "GS-07F-0009"),
        product("Avery", "EA", "4.75", "Beta Supply", "GS-07F-0002"),
        product("Avery Products", "EA", "5.00", "Gamma", "GS-07F-0003"),
        product("Avery", "EA", "5.10", "Delta", "GS-07F-0004"),
    ]
}

#[tokio::test]
async fn fills_three_contiguous_slots_and_marks_misses() {
    let dir = tempdir().expect("tempdir");
    write_store(dir.path(), TWO_ROWS).await;
    let nav = ScriptedNavigator::default()
        .with_results(&q(1), avery_results())
        .with_results(
            &q(2),
            vec![product("Quartet", "EA", "3.10", "Zeta Supply", "GS-07F-0009")],
        );

    let (summary, nav, _) = run(dir.path(), nav, HarvestMode::Full, ShutdownFlag::new()).await;
    assert_eq!(nav.visits, vec![q(1), q(2)]);
    assert_eq!(nav.load_more_calls, 1);
    assert!(nav.closed);
    assert_eq!((summary.filled, summary.slots_written, summary.not_found), (1, 3, 1));
    assert_eq!(summary.saves, 1);

    let saved = reload(dir.path()).await;
    let first = &saved.records()[0];
    let contractors: Vec<_> = first.slots.iter().map(|s| s.contractor.as_deref()).collect();
    assert_eq!(contractors, vec![Some("Acme Office"), Some("Beta Supply"), Some("Gamma")]);
    assert_eq!(first.slots[0].price.as_deref(), Some("4.50"));
    assert_eq!(first.slots[2].contract_number.as_deref(), Some("GS-07F-0003"));
    assert_eq!(saved.records()[1].slots[0].contractor.as_deref(), Some(PRICING_NOT_FOUND));

    let last_run =
        std::fs::read(dir.path().join("catalog.csv.last_run.json")).expect("summary file");
    let last_run: serde_json::Value = serde_json::from_slice(&last_run).expect("summary json");
    assert_eq!(last_run["filled"], 1);
    assert!(last_run["resume_row"].is_null());
}

#[tokio::test]
async fn rerun_touches_nothing_and_keeps_existing_values() {
    let dir = tempdir().expect("tempdir");
    write_store(
        dir.path(),
        "\
Item Number,Manufacturer,Unit of Measure,Links,price_1,contractor_1,contract_number_1
A-1,Avery,EA,https://catalog.test/q/1,9.99,Acme Office,GS-07F-0001
",
    )
    .await;
    let nav = ScriptedNavigator::default().with_results(&q(1), avery_results());
    let (summary, _, _) = run(dir.path(), nav, HarvestMode::Full, ShutdownFlag::new()).await;
    assert_eq!(summary.slots_written, 2);

    let saved = reload(dir.path()).await;
    let record = &saved.records()[0];
    assert_eq!(record.slots[0].price.as_deref(), Some("9.99"));
    let contracts: Vec<_> = record.slots.iter().map(|s| s.contract_number.as_deref()).collect();
    assert_eq!(
        contracts,
        vec![Some("GS-07F-0001"), Some("GS-07F-0002"), Some("GS-07F-0003")]
    );

    let before = tokio::fs::read(dir.path().join("catalog.csv")).await.expect("read");
    let nav = ScriptedNavigator::default().with_results(&q(1), avery_results());
    let (summary, nav, _) = run(dir.path(), nav, HarvestMode::Full, ShutdownFlag::new()).await;
    assert!(nav.visits.is_empty());
    assert_eq!((summary.skipped, summary.saves), (1, 0));
    let after = tokio::fs::read(dir.path().join("catalog.csv")).await.expect("read");
    assert_eq!(before, after);
}

#[tokio::test]
async fn record_with_sin_is_skipped_without_navigation() {
    let dir = tempdir().expect("tempdir");
    write_store(
        dir.path(),
        "\
Item Number,Manufacturer,Unit of Measure,Links,sin_1
S-1,Avery,EA,https://catalog.test/q/1,332510C
",
    )
    .await;
    let nav = ScriptedNavigator::default().with_results(&q(1), avery_results());
    let mode = HarvestMode::Sin { start: None, end: None };
    let (summary, nav, _) = run(dir.path(), nav, mode, ShutdownFlag::new()).await;
    assert!(nav.visits.is_empty());
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.saves, 0);
}

#[tokio::test]
async fn interrupt_finishes_current_row_then_resumes_after_it() {
    let dir = tempdir().expect("tempdir");
    let mut csv = String::from("Item Number,Manufacturer,Unit of Measure,Links\n");
    for n in 1..=4 {
        csv.push_str(&format!("A-{n},Avery,EA,{}\n", q(n)));
    }
    write_store(dir.path(), &csv).await;

    let pages = |nav: ScriptedNavigator| {
        (1..=4).fold(nav, |nav, n| {
            let contract = format!("GS-07F-000{n}");
            let offer = product("Avery", "EA", "4.50", "Acme Office", &contract);
            nav.with_results(&q(n), vec![offer])
        })
    };
    let flag = ShutdownFlag::new();
    let mut nav = pages(ScriptedNavigator::default());
    nav.interrupt_on = Some((q(2), flag.clone()));

    let (summary, nav, _) = run(dir.path(), nav, HarvestMode::Full, flag).await;
    assert_eq!(nav.visits, vec![q(1), q(2)]);
    assert!(summary.interrupted);
    assert_eq!(summary.last_completed_row, Some(2));
    assert_eq!(summary.resume_row, Some(3));

    let saved = reload(dir.path()).await;
    assert_eq!(
        saved.records()[1].slots[0].contract_number.as_deref(),
        Some("GS-07F-0002")
    );
    assert!(saved.records()[2].slots[0].contract_number.is_none());

    let mode = HarvestMode::Range { start: 3, end: 4 };
    let nav = pages(ScriptedNavigator::default());
    let (summary, nav, _) = run(dir.path(), nav, mode, ShutdownFlag::new()).await;
    assert_eq!(nav.visits, vec![q(3), q(4)]);
    assert!(!summary.interrupted);
    let saved = reload(dir.path()).await;
    assert!(saved.records().iter().all(|r| r.slots[0].contract_number.is_some()));
}

#[tokio::test]
async fn transient_failures_retry_and_hard_failures_do_not_stop_the_run() {
    let dir = tempdir().expect("tempdir");
    write_store(dir.path(), TWO_ROWS).await;
    let mut nav = ScriptedNavigator::default()
        .with_results(&q(1), avery_results())
        .with_results(&q(2), avery_results());
    nav.fail_once.insert(q(1));
    let (summary, nav, store) = run(dir.path(), nav, HarvestMode::Full, ShutdownFlag::new()).await;
    assert_eq!(nav.visits, vec![q(1), q(1), q(2)]);
    assert_eq!(nav.restarts, 1);
    assert_eq!((summary.filled, summary.failed), (2, 0));
    assert_eq!(store.records()[0].filled_slots(HarvestKind::Pricing), 3);

    let dir = tempdir().expect("tempdir");
    write_store(dir.path(), TWO_ROWS).await;
    let mut nav = ScriptedNavigator::default().with_results(&q(2), avery_results());
    nav.fail_always.insert(q(1));
    let (summary, nav, store) = run(dir.path(), nav, HarvestMode::Full, ShutdownFlag::new()).await;
    assert_eq!(nav.visits, vec![q(1), q(2)]);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].row, 1);
    assert!(store.records()[0].slots.iter().all(|s| s.contractor.is_none()));
    assert_eq!(summary.filled, 1);
}

#[tokio::test]
async fn sin_mode_prefers_direct_links_and_marks_misses() {
    let dir = tempdir().expect("tempdir");
    write_store(
        dir.path(),
        "\
Item Number,Manufacturer,Unit of Measure,Links,GSA Direct Product Link,GSA Direct Product Link 1
S-1,Avery,EA,https://catalog.test/q/1,https://catalog.test/d/1,https://catalog.test/d/2
S-2,Avery,EA,https://catalog.test/q/2,,
",
    )
    .await;
    let nav = ScriptedNavigator::default()
        .with_text("https://catalog.test/d/1", "Schedule/SIN: MAS/332510C")
        .with_text("https://catalog.test/d/2", "SIN: 339940")
        .with_results(
            &q(2),
            vec![product("Avery", "EA", "4.50", "Acme Office", "GS-07F-0001")
                .with_detail_ref("https://catalog.test/d/3")],
        )
        .with_text("https://catalog.test/d/3", "Contract#: GS-07F-0001");

    let mode = HarvestMode::Sin { start: None, end: None };
    let (summary, nav, _) = run(dir.path(), nav, mode, ShutdownFlag::new()).await;
    assert_eq!(
        nav.visits,
        vec![
            "https://catalog.test/d/1".to_string(),
            "https://catalog.test/d/2".to_string(),
            q(2),
            "https://catalog.test/d/3".to_string(),
        ]
    );
    assert_eq!(summary.not_found, 1);

    let saved = reload(dir.path()).await;
    let sins: Vec<_> = saved.records()[0].slots.iter().map(|s| s.sin.as_deref()).collect();
    assert_eq!(sins, vec![Some("332510C"), Some("339940"), None]);
    assert_eq!(saved.records()[1].slots[0].sin.as_deref(), Some(SIN_NOT_FOUND));
}

#[tokio::test]
async fn marker_lands_in_first_open_slot_when_page_only_repeats_held_offer() {
    let dir = tempdir().expect("tempdir");
    write_store(
        dir.path(),
        "\
Item Number,Manufacturer,Unit of Measure,Links,price_1,contractor_1,contract_number_1
A-1,Avery,EA,https://catalog.test/q/1,4.50,Acme Office,GS-07F-0001
",
    )
    .await;
    let held = || {
        ScriptedNavigator::default().with_results(
            &q(1),
            vec![product("Avery", "EA", "4.50", "Acme Office", "GS-07F-0001")],
        )
    };
    let (summary, nav, _) = run(dir.path(), held(), HarvestMode::Full, ShutdownFlag::new()).await;
    assert_eq!(nav.visits, vec![q(1)]);
    assert_eq!((summary.not_found, summary.unchanged), (1, 0));

    let saved = reload(dir.path()).await;
    let record = &saved.records()[0];
    assert_eq!(record.slots[0].contractor.as_deref(), Some("Acme Office"));
    assert_eq!(record.slots[1].contractor.as_deref(), Some(PRICING_NOT_FOUND));
    assert_eq!(record.filled_slots(HarvestKind::Pricing), 1);

    let (summary, nav, _) = run(dir.path(), held(), HarvestMode::Full, ShutdownFlag::new()).await;
    assert!(nav.visits.is_empty());
    assert_eq!((summary.skipped, summary.saves), (1, 0));
}

#[tokio::test]
async fn sin_search_follows_products_already_priced() {
    let dir = tempdir().expect("tempdir");
    write_store(
        dir.path(),
        "\
Item Number,Manufacturer,Unit of Measure,Links,price_1,contractor_1,contract_number_1
S-1,Avery,EA,https://catalog.test/q/1,4.50,Acme,GS-07F-0001
",
    )
    .await;
    let nav = ScriptedNavigator::default()
        .with_results(
            &q(1),
            vec![product("Avery", "EA", "4.50", "Acme", "GS-07F-0001")
                .with_detail_ref("https://catalog.test/d/1")],
        )
        .with_text("https://catalog.test/d/1", "Schedule/SIN: MAS/332510C");

    let mode = HarvestMode::Sin { start: None, end: None };
    let (summary, nav, _) = run(dir.path(), nav, mode, ShutdownFlag::new()).await;
    assert_eq!(nav.visits, vec![q(1), "https://catalog.test/d/1".to_string()]);
    assert_eq!((summary.filled, summary.not_found), (1, 0));

    let saved = reload(dir.path()).await;
    let record = &saved.records()[0];
    assert_eq!(record.slots[0].sin.as_deref(), Some("332510C"));
    assert_eq!(record.slots[0].contract_number.as_deref(), Some("GS-07F-0001"));
}

async fn single_avery_row(dir: &Path) {
    write_store(
        dir,
        "Item Number,Manufacturer,Unit of Measure,Links\nA-1,Avery,EA,https://catalog.test/q/1\n",
    )
    .await;
}

fn growing_page() -> ScriptedNavigator {
    ScriptedNavigator::default()
        .with_results(&q(1), vec![product("Avery", "EA", "4.50", "Acme", "GS-07F-0001")])
        .with_more(
            &q(1),
            vec![
                vec![product("Avery", "EA", "4.60", "Beta", "GS-07F-0002")],
                vec![product("Avery", "EA", "4.70", "Gamma", "GS-07F-0003")],
                vec![product("Avery", "EA", "4.80", "Delta", "GS-07F-0004")],
            ],
        )
}

#[tokio::test]
async fn load_more_stops_once_enough_offers_match() {
    let dir = tempdir().expect("tempdir");
    single_avery_row(dir.path()).await;
    let (summary, nav, store) =
        run_tuned(dir.path(), growing_page(), HarvestMode::Full, |_| {}).await;
    assert_eq!(nav.load_more_calls, 2);
    assert_eq!(summary.slots_written, 3);
    let contracts: Vec<_> = store.records()[0]
        .slots
        .iter()
        .map(|s| s.contract_number.as_deref())
        .collect();
    assert_eq!(
        contracts,
        vec![Some("GS-07F-0001"), Some("GS-07F-0002"), Some("GS-07F-0003")]
    );

    let dir = tempdir().expect("tempdir");
    single_avery_row(dir.path()).await;
    let nav = ScriptedNavigator::default().with_results(&q(1), avery_results());
    let (_, nav, _) = run_tuned(dir.path(), nav, HarvestMode::Full, |_| {}).await;
    assert_eq!(nav.load_more_calls, 0);
}

#[tokio::test]
async fn load_more_is_bounded_by_max_scrolls_and_by_a_page_that_stops_growing() {
    let dir = tempdir().expect("tempdir");
    single_avery_row(dir.path()).await;
    let tune = |config: &mut HarvestConfig| config.max_scrolls = 1;
    let (summary, nav, _) = run_tuned(dir.path(), growing_page(), HarvestMode::Full, tune).await;
    assert_eq!(nav.load_more_calls, 1);
    assert_eq!(summary.slots_written, 2);

    let dir = tempdir().expect("tempdir");
    single_avery_row(dir.path()).await;
    let nav = ScriptedNavigator::default()
        .with_results(&q(1), vec![product("Avery", "EA", "4.50", "Acme", "GS-07F-0001")]);
    let (summary, nav, store) = run_tuned(dir.path(), nav, HarvestMode::Full, |_| {}).await;
    assert_eq!(nav.load_more_calls, 1);
    assert_eq!(summary.slots_written, 1);
    assert!(!HarvestMode::Full.is_complete(&store.records()[0]));
}

#[tokio::test]
async fn navigator_is_recycled_between_records() {
    let dir = tempdir().expect("tempdir");
    let mut csv = String::from("Item Number,Manufacturer,Unit of Measure,Links\n");
    let mut nav = ScriptedNavigator::default();
    for n in 1..=3 {
        csv.push_str(&format!("A-{n},Avery,EA,{}\n", q(n)));
        nav = nav.with_results(&q(n), avery_results());
    }
    write_store(dir.path(), &csv).await;

    let tune = |config: &mut HarvestConfig| config.recycle_every = 1;
    let (summary, nav, _) = run_tuned(dir.path(), nav, HarvestMode::Full, tune).await;
    assert_eq!(nav.visits, vec![q(1), q(2), q(3)]);
    assert_eq!(nav.restarts, 2);
    assert_eq!(summary.filled, 3);
}

#[tokio::test]
async fn unhealthy_navigator_is_restarted_before_the_record() {
    let dir = tempdir().expect("tempdir");
    single_avery_row(dir.path()).await;
    let mut nav = ScriptedNavigator::default().with_results(&q(1), avery_results());
    nav.unhealthy = true;
    let (summary, nav, _) = run_tuned(dir.path(), nav, HarvestMode::Full, |_| {}).await;
    assert_eq!(nav.restarts, 1);
    assert_eq!(nav.visits, vec![q(1)]);
    assert_eq!(summary.filled, 1);
}

#[tokio::test]
async fn transient_failures_give_up_after_max_attempts() {
    let dir = tempdir().expect("tempdir");
    write_store(dir.path(), TWO_ROWS).await;
    let mut nav = ScriptedNavigator::default().with_results(&q(2), avery_results());
    nav.time_out.insert(q(1));
    let tune = |config: &mut HarvestConfig| config.max_attempts = 3;
    let (summary, nav, store) = run_tuned(dir.path(), nav, HarvestMode::Full, tune).await;
    assert_eq!(nav.visits, vec![q(1), q(1), q(1), q(2)]);
    assert_eq!(nav.restarts, 2);
    assert_eq!((summary.failed, summary.filled), (1, 1));
    assert_eq!(summary.failures[0].phase, Phase::Navigate);
    assert!(summary.failures[0].error.contains("timed out"));
    assert!(store.records()[0].slots.iter().all(|s| s.contractor.is_none()));
}

#[tokio::test]
async fn failed_checkpoint_stops_the_run_and_closes_the_navigator() {
    let dir = tempdir().expect("tempdir");
    single_avery_row(dir.path()).await;
    let Harness {
        config,
        checkpointer,
        mut store,
        matcher,
    } = harness(dir.path(), |_| {}).await;
    // backups can no longer be written once their directory is a file
    let backups = dir.path().join("backups");
    std::fs::remove_dir_all(&backups).expect("remove backups");
    std::fs::write(&backups, "").expect("block backups");

    let nav = ScriptedNavigator::default().with_results(&q(1), avery_results());
    let mut engine = HarvestEngine::new(config, nav, matcher, checkpointer, ShutdownFlag::new());
    let err = engine.run(&mut store, &HarvestMode::Full).await.unwrap_err();
    assert!(format!("{err:#}").contains("saving"));
    let nav = engine.into_navigator();
    assert_eq!(nav.visits, vec![q(1)]);
    assert!(nav.closed);
}
