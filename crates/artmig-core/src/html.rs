//! HTML body rewriting.
//!
//! Two independent passes over a best-effort fragment parse: markup
//! normalization and inline image rewriting. Parse errors are discarded;
//! whatever tree the parser builds is what gets rewritten.
//!
//! Both passes snapshot the candidate node ids before touching the tree.
//! Mutating a live traversal is how DOM rewrites corrupt themselves, so
//! the snapshot-then-mutate shape is deliberate and load-bearing.

use ego_tree::NodeId;
use scraper::node::Node;
use scraper::Html;
use tracing::{debug, warn};
use url::Url;

use crate::assets::{AssetHandle, AssetTransfer, CollisionPolicy};
use crate::error::{MigrateError, Result};
use crate::fetch::strip_known_prefixes;

const NBSP: char = '\u{a0}';

/// Normalize legacy markup.
///
/// Strips presentational attributes (`class`, `style`, `id`), promotes
/// content-bearing `<div>`s to `<p>`, prunes empty `<p>`/`<div>`/`<span>`
/// wrappers, and replaces non-breaking spaces with ordinary spaces.
/// Running it over its own output is a no-op.
pub fn normalize(fragment: &str) -> String {
    let mut html = Html::parse_fragment(fragment);

    strip_presentational_attrs(&mut html);
    promote_divs(&mut html);
    prune_empty_wrappers(&mut html);
    collapse_nbsp(&mut html);

    html.root_element().inner_html()
}

/// Rewrite every `<img src=…>` to point at a destination asset.
///
/// Each source is fetched (absolute URLs directly, relative sources via
/// the files base) and stored under the article's body-image directory.
/// Unresolvable images are excised: no surviving `<img>` may reference
/// the legacy site.
pub fn rewrite_images(fragment: &str, nid: i64, assets: &AssetTransfer<'_>) -> Result<String> {
    let mut html = Html::parse_fragment(fragment);

    let imgs: Vec<(NodeId, String)> = html
        .tree
        .nodes()
        .filter_map(|node| match node.value() {
            Node::Element(el) if el.name.local.as_ref() == "img" => el
                .attr("src")
                .filter(|src| !src.trim().is_empty())
                .map(|src| (node.id(), src.to_string())),
            _ => None,
        })
        .collect();

    for (id, src) in imgs {
        match transfer_body_image(&src, nid, assets) {
            Ok(handle) => {
                debug!(src, url = handle.url, "rewrote body image");
                set_src(&mut html, id, &handle.url);
            }
            Err(err) if err.is_recoverable() => {
                warn!(src, error = %err, "dropping unresolvable body image");
                if let Some(mut node) = html.tree.get_mut(id) {
                    node.detach();
                }
            }
            Err(err) => return Err(err),
        }
    }

    Ok(html.root_element().inner_html())
}

/// Fetch one inline image and persist it under `body_images/<nid>/`.
///
/// Body images are keyed by article and basename rather than by a source
/// file id, so they are stored with the rename policy instead of being
/// deduplicated through the mapping ledger.
fn transfer_body_image(src: &str, nid: i64, assets: &AssetTransfer<'_>) -> Result<AssetHandle> {
    let no_basename = || MigrateError::FetchFailed {
        locator: src.to_string(),
        message: "no usable basename".into(),
    };

    // Non-special schemes like public:// parse as URLs with a host;
    // only genuine web URLs take the direct-fetch branch.
    if let Ok(url) = Url::parse(src) {
        if matches!(url.scheme(), "http" | "https") && url.has_host() {
            let basename = url
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .map(str::to_string)
                .ok_or_else(no_basename)?;
            let dest = AssetTransfer::body_image_dest(nid, &basename);
            return assets.store_url(src, &dest, CollisionPolicy::Rename);
        }
    }

    let relative = strip_known_prefixes(src.split(['?', '#']).next().unwrap_or(src));
    let basename = relative
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(no_basename)?;
    let dest = AssetTransfer::body_image_dest(nid, basename);
    assets.store_relative(relative, &dest, CollisionPolicy::Rename)
}

fn set_src(html: &mut Html, id: NodeId, url: &str) {
    if let Some(mut node) = html.tree.get_mut(id) {
        if let Node::Element(el) = node.value() {
            for (name, value) in el.attrs.iter_mut() {
                if name.local.as_ref() == "src" {
                    *value = url.into();
                }
            }
        }
    }
}

fn strip_presentational_attrs(html: &mut Html) {
    let ids: Vec<NodeId> = html
        .tree
        .nodes()
        .filter(|node| node.value().is_element())
        .map(|node| node.id())
        .collect();
    for id in ids {
        if let Some(mut node) = html.tree.get_mut(id) {
            if let Node::Element(el) = node.value() {
                el.attrs
                    .retain(|name, _| !matches!(name.local.as_ref(), "class" | "style" | "id"));
            }
        }
    }
}

/// Elements `<p>` cannot legally contain. A rename that nests one of
/// these inside a `<p>` serializes to markup the next parse restructures,
/// so such wrappers are left as `<div>`.
const BLOCK_CHILDREN: &[&str] = &[
    "address", "article", "aside", "blockquote", "div", "dl", "fieldset", "figure", "footer",
    "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "main", "nav", "ol", "p", "pre",
    "section", "table", "ul",
];

/// A `<div>` with non-whitespace text or an element child is block-level
/// content; rename it to `<p>` in place, keeping attributes and children.
/// Divs holding block children stay divs, keeping the output stable under
/// repeated normalization.
fn promote_divs(html: &mut Html) {
    let promote: Vec<NodeId> = html
        .tree
        .nodes()
        .filter(|node| {
            let Node::Element(el) = node.value() else {
                return false;
            };
            if el.name.local.as_ref() != "div" {
                return false;
            }
            let has_block_child = node.children().any(|child| match child.value() {
                Node::Element(el) => BLOCK_CHILDREN.contains(&el.name.local.as_ref()),
                _ => false,
            });
            if has_block_child {
                return false;
            }
            node.children().any(|child| child.value().is_element())
                || !descendant_text(*node).replace(NBSP, " ").trim().is_empty()
        })
        .map(|node| node.id())
        .collect();
    for id in promote {
        if let Some(mut node) = html.tree.get_mut(id) {
            if let Node::Element(el) = node.value() {
                el.name.local = "p".into();
            }
        }
    }
}

/// Remove `<p>`/`<div>`/`<span>` whose collapsed text is blank and which
/// have no element children. Processed innermost-first so that a wrapper
/// emptied by a pruned child is itself pruned in the same pass. Wrappers
/// holding only inline leaf elements (an `<img>`, a link) have element
/// children and survive.
fn prune_empty_wrappers(html: &mut Html) {
    let candidates: Vec<NodeId> = html
        .tree
        .nodes()
        .filter(|node| match node.value() {
            Node::Element(el) => matches!(el.name.local.as_ref(), "p" | "div" | "span"),
            _ => false,
        })
        .map(|node| node.id())
        .collect();

    for id in candidates.into_iter().rev() {
        let Some(node) = html.tree.get(id) else {
            continue;
        };
        if !is_attached(&html.tree, id) {
            continue;
        }
        let has_element_child = node.children().any(|child| child.value().is_element());
        if has_element_child {
            continue;
        }
        if descendant_text(node).replace(NBSP, " ").trim().is_empty() {
            if let Some(mut node) = html.tree.get_mut(id) {
                node.detach();
            }
        }
    }
}

fn collapse_nbsp(html: &mut Html) {
    let ids: Vec<NodeId> = html
        .tree
        .nodes()
        .filter(|node| matches!(node.value(), Node::Text(text) if text.contains(NBSP)))
        .map(|node| node.id())
        .collect();
    for id in ids {
        if let Some(mut node) = html.tree.get_mut(id) {
            if let Node::Text(text) = node.value() {
                let replaced = text.text.replace(NBSP, " ");
                text.text = replaced.as_str().into();
            }
        }
    }
}

fn descendant_text(node: ego_tree::NodeRef<'_, Node>) -> String {
    let mut out = String::new();
    for descendant in node.descendants() {
        if let Node::Text(text) = descendant.value() {
            out.push_str(text);
        }
    }
    out
}

/// Whether a node is still reachable from the tree root. Detaching a
/// subtree leaves its nodes in the arena, so the snapshot may hold ids
/// that no longer serialize.
fn is_attached(tree: &ego_tree::Tree<Node>, id: NodeId) -> bool {
    let root_id = tree.root().id();
    let mut current = tree.get(id);
    while let Some(node) = current {
        if node.id() == root_id {
            return true;
        }
        current = node.parent();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilesBase;
    use crate::fetch::ResourceFetcher;
    use crate::store::SqliteDestination;
    use rusqlite::Connection;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_strips_attrs_and_promotes_div() {
        let out = normalize(r#"<div style="x" class="y"><b>hi</b></div>"#);
        assert_eq!(out, "<p><b>hi</b></p>");
    }

    #[test]
    fn test_normalize_removes_nbsp_only_paragraph() {
        assert_eq!(normalize("<p>\u{a0}</p>"), "");
        assert_eq!(normalize("<p>&nbsp;</p>"), "");
    }

    #[test]
    fn test_normalize_keeps_wrappers_with_element_children() {
        let out = normalize(r#"<p><img src="a.jpg"></p>"#);
        assert_eq!(out, r#"<p><img src="a.jpg"></p>"#);
    }

    #[test]
    fn test_normalize_prunes_emptied_nesting() {
        // The span is blank; once it is gone the paragraph is blank too.
        assert_eq!(normalize("<p><span> </span></p>"), "");
    }

    #[test]
    fn test_normalize_replaces_nbsp_in_text() {
        assert_eq!(normalize("<p>one\u{a0}two</p>"), "<p>one two</p>");
    }

    #[test]
    fn test_normalize_leaves_whitespace_only_div_unpromoted() {
        // Blank div is never promoted, then pruned as empty.
        assert_eq!(normalize("<div>   </div>"), "");
    }

    #[test]
    fn test_normalize_keeps_divs_with_block_children() {
        // Renaming these wrappers would nest blocks inside <p>, which the
        // next parse would restructure.
        assert_eq!(
            normalize("<div><div>hi</div></div>"),
            "<div><p>hi</p></div>"
        );
        assert_eq!(
            normalize("<div><ul><li>x</li></ul></div>"),
            "<div><ul><li>x</li></ul></div>"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let messy = concat!(
            r#"<div class="wrap"><b>Lead</b> story</div>"#,
            "<p>\u{a0}</p>",
            r#"<p id="x">Body&nbsp;text</p><span></span>"#,
            r#"<div><div>nested</div></div>"#,
            r#"<div><ul><li>item</li></ul></div>"#,
        );
        let once = normalize(messy);
        let twice = normalize(&once);
        assert_eq!(once, twice);
        assert!(!once.contains('\u{a0}'));
        assert!(!once.contains("class"));
    }

    #[test]
    fn test_normalize_tolerates_malformed_input() {
        // Unclosed tags and stray brackets parse best-effort, not panic.
        let out = normalize("<p><b>open<div>deep</p><<<");
        assert!(out.contains("deep"));
    }

    struct Fixture {
        _source: TempDir,
        _dest: TempDir,
        fetcher: ResourceFetcher,
        store: SqliteDestination,
        files_root: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("inline.jpg"), b"img").unwrap();
        let dest = TempDir::new().unwrap();
        let files_root = dest.path().join("files");
        Fixture {
            fetcher: ResourceFetcher::new(FilesBase::Local(source.path().to_path_buf())).unwrap(),
            store: SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
                .unwrap(),
            files_root,
            _source: source,
            _dest: dest,
        }
    }

    #[test]
    fn test_rewrite_resolves_relative_image() {
        let fx = fixture();
        let assets = AssetTransfer::new(
            &fx.fetcher,
            &fx.store,
            &fx.files_root,
            "https://new.example.org/files",
        );
        let out =
            rewrite_images(r#"<p><img src="/sites/default/files/inline.jpg"></p>"#, 7, &assets)
                .unwrap();
        assert_eq!(
            out,
            r#"<p><img src="https://new.example.org/files/body_images/7/inline.jpg"></p>"#
        );
        assert!(fx.files_root.join("body_images/7/inline.jpg").is_file());
    }

    #[test]
    fn test_rewrite_excises_unresolvable_image() {
        let fx = fixture();
        let assets = AssetTransfer::new(&fx.fetcher, &fx.store, &fx.files_root, "https://n/f");
        let out = rewrite_images(
            r#"<p>text <img src="missing.jpg"> more</p>"#,
            7,
            &assets,
        )
        .unwrap();
        assert_eq!(out, "<p>text  more</p>");
        assert!(!out.contains("img"));
    }

    #[test]
    fn test_rewrite_never_leaves_legacy_src() {
        let fx = fixture();
        let assets = AssetTransfer::new(&fx.fetcher, &fx.store, &fx.files_root, "https://n/f");
        let out = rewrite_images(
            r#"<p><img src="inline.jpg"><img src="missing.png"></p>"#,
            3,
            &assets,
        )
        .unwrap();
        let html = Html::parse_fragment(&out);
        for node in html.tree.nodes() {
            if let Node::Element(el) = node.value() {
                if el.name.local.as_ref() == "img" {
                    assert!(el.attr("src").unwrap().starts_with("https://n/f/"));
                }
            }
        }
    }

    #[test]
    fn test_rewrite_without_images_is_passthrough() {
        let fx = fixture();
        let assets = AssetTransfer::new(&fx.fetcher, &fx.store, &fx.files_root, "https://n/f");
        let out = rewrite_images("<p>plain</p>", 1, &assets).unwrap();
        assert_eq!(out, "<p>plain</p>");
    }
}
