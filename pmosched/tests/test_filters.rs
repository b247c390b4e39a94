use pmocache::{Cache, RendererRegistry};
use pmocds::ContentSet;
use pmoconfig::Config;
use pmosched::filters::{FilterContext, FilterPipeline};
use pmostore::{ContextStore, CONTEXT_TYPE_CONTENT_TRIGGER, CONTEXT_TYPE_TOUCH_INPUT};
use pmoutils::xml::parse_str;
use tempfile::TempDir;

struct Fixture {
    _store_dir: TempDir,
    cache_dir: TempDir,
    ctx: FilterContext,
}

fn fixture() -> Fixture {
    let store_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let ctx = FilterContext {
        context_store: ContextStore::open(store_dir.path().join("context.sqlite")).unwrap(),
        cache: Cache::new(cache_dir.path()),
        registry: RendererRegistry::from_config(&Config::builtin().unwrap()),
    };
    Fixture {
        _store_dir: store_dir,
        cache_dir,
        ctx,
    }
}

fn item_xml(uri: &str, content_type: &str, constraints: &str) -> String {
    format!(
        "<content-item content-type='{content_type}'>{constraints}\
           <requires-file><sources><uri>{uri}</uri></sources></requires-file>\
         </content-item>"
    )
}

fn cds_of(items: &[String]) -> ContentSet {
    let xml = format!("<content-set type='inline'>{}</content-set>", items.join(""));
    ContentSet::parse(&parse_str(&xml).unwrap()).unwrap()
}

/// Put a fake cached file in place for the given URI.
fn pretend_cached(fixture: &Fixture, uri: &str) {
    let name = Cache::file_name_for_uri(uri);
    std::fs::write(fixture.cache_dir.path().join(name), b"cached").unwrap();
}

fn uris(cds: &ContentSet) -> Vec<String> {
    cds.content_items()
        .into_iter()
        .map(|item| item.uri().to_string())
        .collect()
}

#[test]
fn unknown_content_types_are_dropped() {
    let fixture = fixture();
    let web = item_xml("http://e.com/page.html", "text/html", "");
    let weird = item_xml("http://e.com/model.glb", "model/gltf-binary", "");
    let cds = cds_of(&[web, weird]);

    let filtered = FilterPipeline::standard().filter_cds(&cds, &fixture.ctx);
    assert_eq!(uris(&filtered), vec!["http://e.com/page.html"]);
}

#[test]
fn uncached_items_are_dropped_until_cached() {
    let fixture = fixture();
    let cached = item_xml("http://e.com/a.jpg", "image/jpeg", "");
    let uncached = item_xml("http://e.com/b.jpg", "image/jpeg", "");
    pretend_cached(&fixture, "http://e.com/a.jpg");
    let cds = cds_of(&[cached, uncached]);

    let filtered = FilterPipeline::standard().filter_cds(&cds, &fixture.ctx);
    assert_eq!(uris(&filtered), vec!["http://e.com/a.jpg"]);
}

#[test]
fn expired_date_constraints_drop_the_item() {
    let fixture = fixture();
    let expired = item_xml(
        "http://e.com/old.html",
        "text/html",
        "<constraints><scheduling-constraints>\
         <date><between start='2001-01-01' end='2001-12-31'/></date>\
         </scheduling-constraints></constraints>",
    );
    let open_ended = item_xml(
        "http://e.com/now.html",
        "text/html",
        "<constraints><scheduling-constraints>\
         <date><between start='2001-01-01' end='2999-12-31'/></date>\
         </scheduling-constraints></constraints>",
    );
    let cds = cds_of(&[expired, open_ended]);

    let filtered = FilterPipeline::standard().filter_cds(&cds, &fixture.ctx);
    assert_eq!(uris(&filtered), vec!["http://e.com/now.html"]);
}

#[test]
fn priority_gating_descends_to_the_default_level() {
    let fixture = fixture();
    let high = item_xml(
        "http://e.com/a.html",
        "text/html",
        "<constraints><scheduling-constraints>\
         <priority level='high'/>\
         </scheduling-constraints></constraints>",
    );
    let unprioritised = item_xml("http://e.com/b.html", "text/html", "");

    // With both present, only the high-priority item plays.
    let both = cds_of(&[high.clone(), unprioritised.clone()]);
    let filtered = FilterPipeline::standard().filter_cds(&both, &fixture.ctx);
    assert_eq!(uris(&filtered), vec!["http://e.com/a.html"]);

    // Remove the high item: the sweep descends to medium, where
    // unconstrained items live.
    let rest = cds_of(&[unprioritised]);
    let filtered = FilterPipeline::standard().filter_cds(&rest, &fixture.ctx);
    assert_eq!(uris(&filtered), vec!["http://e.com/b.html"]);
}

#[test]
fn a_recent_touch_input_selects_its_item() {
    let fixture = fixture();
    let a = item_xml("http://e.com/a.html", "text/html", "");
    let b = item_xml("http://e.com/b.html", "text/html", "");
    let cds = cds_of(&[a, b.clone()]);

    // The stored record is the touched item's own XML.
    let touched = cds.content_items()[1].to_xml_string();
    fixture
        .ctx
        .context_store
        .add_context(CONTEXT_TYPE_TOUCH_INPUT, Some(&touched))
        .unwrap();

    let filtered = FilterPipeline::standard().filter_cds(&cds, &fixture.ctx);
    assert_eq!(uris(&filtered), vec!["http://e.com/b.html"]);
}

#[test]
fn a_touch_input_outside_the_schedule_is_ignored() {
    let fixture = fixture();
    let a = item_xml("http://e.com/a.html", "text/html", "");
    let cds = cds_of(&[a]);

    let foreign = item_xml("http://elsewhere.com/x.html", "text/html", "");
    fixture
        .ctx
        .context_store
        .add_context(CONTEXT_TYPE_TOUCH_INPUT, Some(&foreign))
        .unwrap();

    let filtered = FilterPipeline::standard().filter_cds(&cds, &fixture.ctx);
    assert_eq!(uris(&filtered), vec!["http://e.com/a.html"]);
}

#[test]
fn a_recent_content_trigger_narrows_the_schedule() {
    let fixture = fixture();
    let a = item_xml("http://e.com/campaign/a.html", "text/html", "");
    let b = item_xml("http://e.com/other/b.html", "text/html", "");
    let cds = cds_of(&[a, b]);

    let trigger = item_xml("http://e.com/campaign/a.html", "text/html", "");
    fixture
        .ctx
        .context_store
        .add_context(CONTEXT_TYPE_CONTENT_TRIGGER, Some(&trigger))
        .unwrap();

    let filtered = FilterPipeline::standard().filter_cds(&cds, &fixture.ctx);
    assert_eq!(uris(&filtered), vec!["http://e.com/campaign/a.html"]);
}

#[test]
fn empty_results_short_circuit_the_pipeline() {
    let fixture = fixture();
    let uncached = item_xml("http://e.com/missing.jpg", "image/jpeg", "");
    let cds = cds_of(&[uncached]);

    let filtered = FilterPipeline::standard().filter_cds(&cds, &fixture.ctx);
    assert!(filtered.is_empty());
}

#[test]
fn the_pipeline_is_idempotent() {
    let fixture = fixture();
    let items = [
        item_xml("http://e.com/a.jpg", "image/jpeg", ""),
        item_xml("http://e.com/b.html", "text/html", ""),
        item_xml(
            "http://e.com/c.html",
            "text/html",
            "<constraints><scheduling-constraints>\
             <date><between start='2001-01-01' end='2001-12-31'/></date>\
             </scheduling-constraints></constraints>",
        ),
        item_xml("http://e.com/d.bin", "model/gltf-binary", ""),
    ];
    pretend_cached(&fixture, "http://e.com/a.jpg");
    let cds = cds_of(&items);

    let pipeline = FilterPipeline::standard();
    let once = pipeline.filter_cds(&cds, &fixture.ctx);
    let twice = pipeline.filter_cds(&once, &fixture.ctx);
    assert_eq!(once, twice);
    assert_eq!(uris(&once).len(), 2);
}
