use pmostore::SubscriptionStore;
use pmoutils::xml::{element_to_string, parse_str};
use tempfile::TempDir;

fn create_store() -> (TempDir, SubscriptionStore) {
    let temp_dir = tempfile::tempdir().unwrap();
    let store = SubscriptionStore::open(temp_dir.path().join("subs.sqlite")).unwrap();
    (temp_dir, store)
}

const ROOT_URI: &str = "file:///tmp/root.xml";
const CHILD_URI: &str = "http://example.com/campaign.xml";

// La racine contient un enfant distant portant une contrainte de
// playback sur le placeholder.
fn root_elem() -> xmltree::Element {
    parse_str(&format!(
        "<content-set type='inline'>\
           <content-item content-type='image/jpeg'>\
             <requires-file><sources><uri>http://example.com/a.jpg</uri></sources></requires-file>\
           </content-item>\
           <content-set type='remote'>\
             <constraints><scheduling-constraints>\
               <playback ratio='50%'/>\
             </scheduling-constraints></constraints>\
             <requires-file><sources><uri>{CHILD_URI}</uri></sources></requires-file>\
           </content-set>\
         </content-set>"
    ))
    .unwrap()
}

fn child_elem() -> xmltree::Element {
    parse_str(
        "<content-set type='inline'>\
           <content-item content-type='image/png'>\
             <requires-file><sources><uri>http://example.com/b.png</uri></sources></requires-file>\
           </content-item>\
           <content-item content-type='image/png'>\
             <requires-file><sources><uri>http://example.com/c.png</uri></sources></requires-file>\
           </content-item>\
         </content-set>",
    )
    .unwrap()
}

#[test]
fn store_links_remote_children() {
    let (_tmp, store) = create_store();
    let root_id = store
        .store_descriptor_set(&root_elem(), &[ROOT_URI.to_string()])
        .unwrap();

    let child_id = store.select_xml_id_for_uri(CHILD_URI).unwrap().unwrap();
    assert_eq!(store.select_child_ids(root_id).unwrap(), vec![child_id]);
    assert_eq!(store.select_parent_id(child_id).unwrap(), Some(root_id));
    assert_eq!(store.select_parent_id(root_id).unwrap(), None);
}

#[test]
fn root_lookup_walks_parent_links() {
    let (_tmp, store) = create_store();
    let root_id = store
        .store_descriptor_set(&root_elem(), &[ROOT_URI.to_string()])
        .unwrap();

    // Depuis l'URI de l'enfant on remonte à la racine.
    assert_eq!(
        store.select_root_id_for_uri(CHILD_URI).unwrap(),
        Some(root_id)
    );
    assert_eq!(
        store.select_root_id_for_uri(ROOT_URI).unwrap(),
        Some(root_id)
    );
    assert_eq!(store.select_root_id_for_uri("file:///nope").unwrap(), None);
}

#[test]
fn reassemble_before_child_arrives_drops_placeholder() {
    let (_tmp, store) = create_store();
    let root_id = store
        .store_descriptor_set(&root_elem(), &[ROOT_URI.to_string()])
        .unwrap();

    let tree = store.reassemble(root_id).unwrap().unwrap();
    let sets: Vec<_> = tree
        .children
        .iter()
        .filter_map(|n| n.as_element())
        .filter(|e| e.name == "content-set")
        .collect();
    assert!(sets.is_empty(), "pending placeholder should not be forwarded");
}

#[test]
fn reassemble_splices_child_and_merges_constraints() {
    let (_tmp, store) = create_store();
    let root_id = store
        .store_descriptor_set(&root_elem(), &[ROOT_URI.to_string()])
        .unwrap();
    // Le flux de l'enfant arrive à son tour.
    store
        .store_descriptor_set(&child_elem(), &[CHILD_URI.to_string()])
        .unwrap();

    let tree = store.reassemble(root_id).unwrap().unwrap();
    let spliced = tree
        .children
        .iter()
        .filter_map(|n| n.as_element())
        .find(|e| e.name == "content-set")
        .expect("child subtree spliced in place");

    // Le sous-arbre récupéré remplace le placeholder…
    let items: Vec<_> = spliced
        .children
        .iter()
        .filter_map(|n| n.as_element())
        .filter(|e| e.name == "content-item")
        .collect();
    assert_eq!(items.len(), 2);

    // …et hérite de la contrainte du placeholder.
    let constraints = spliced.get_child("constraints").unwrap();
    let merged = element_to_string(constraints);
    assert!(merged.contains("playback"), "merged: {merged}");
}

#[test]
fn updated_root_replaces_stored_xml() {
    let (_tmp, store) = create_store();
    let first = store
        .store_descriptor_set(&root_elem(), &[ROOT_URI.to_string()])
        .unwrap();

    let updated = parse_str(
        "<content-set type='inline'>\
           <content-item content-type='video/mp4'>\
             <requires-file><sources><uri>http://example.com/v.mp4</uri></sources></requires-file>\
           </content-item>\
         </content-set>",
    )
    .unwrap();
    let second = store
        .store_descriptor_set(&updated, &[ROOT_URI.to_string()])
        .unwrap();

    assert_eq!(first, second);
    let xml = store.select_xml(first).unwrap().unwrap();
    assert!(xml.contains("video/mp4"));
}
