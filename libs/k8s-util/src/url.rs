const CORE_GROUP_PREFIX: &str = "api";
const NAMED_GROUP_PREFIX: &str = "apis";
const SUBRESOURCES: [&str; 2] = ["finalize", "status"];

/// Replaces object name and namespace segments of an API request path with
/// `{name}` / `{namespace}` placeholders, keeping metric label cardinality
/// bounded. Paths outside the `/api` and `/apis` trees collapse to
/// `/{prefix}`. Template scheme follows client-go's request metrics.
pub fn template_path(path: &str, base_path: Option<&str>) -> String {
    let (prefix, rest) = match base_path {
        Some(base) if path.starts_with(base) => (base, path.trim_start_matches(base)),
        _ => ("", path),
    };
    let mut segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

    if segments.len() <= 2 {
        // nothing nameable in the path
        return path.to_owned();
    }

    // number of segments occupied by the group/version prefix
    let skip = match segments[0] {
        CORE_GROUP_PREFIX => 2,
        NAMED_GROUP_PREFIX => 3,
        _ => return "/{prefix}".to_owned(),
    };

    match segments.len() - skip {
        // bare resource list
        1 => {}
        // /$RESOURCE/$NAME
        2 => segments[skip + 1] = "{name}",
        3 => {
            if SUBRESOURCES.contains(&segments[skip + 2]) {
                // /$RESOURCE/$NAME/$SUBRESOURCE
                segments[skip + 1] = "{name}";
            } else {
                // /namespaces/$NAMESPACE/$RESOURCE
                segments[skip + 1] = "{namespace}";
            }
        }
        // /namespaces/$NAMESPACE/$RESOURCE/$NAME[/$SUBRESOURCE]
        _ => {
            segments[skip + 1] = "{namespace}";
            if !SUBRESOURCES.contains(&segments[skip + 3]) {
                segments[skip + 3] = "{name}";
            }
        }
    }

    format!("{}/{}", prefix.trim_end_matches('/'), segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path_is_untouched() {
        assert_eq!(template_path("/", None), "/");
    }

    #[test]
    fn core_group_name_is_templated() {
        assert_eq!(template_path("/api/v1/pods/mypod", None), "/api/v1/pods/{name}");
    }

    #[test]
    fn named_group_namespace_and_name_are_templated() {
        assert_eq!(
            template_path(
                "/apis/apps/v1/namespaces/mynamespace/deployments/mydeployment",
                None
            ),
            "/apis/apps/v1/namespaces/{namespace}/deployments/{name}"
        );
    }

    #[test]
    fn subresources_are_preserved() {
        assert_eq!(
            template_path(
                "/apis/apps/v1/namespaces/ns/deployments/mydeployment/finalize",
                None
            ),
            "/apis/apps/v1/namespaces/{namespace}/deployments/{name}/finalize"
        );
        assert_eq!(
            template_path(
                "/apis/apps/v1/namespaces/ns/deployments/mydeployment/status",
                None
            ),
            "/apis/apps/v1/namespaces/{namespace}/deployments/{name}/status"
        );
    }

    #[test]
    fn unknown_trees_collapse_to_prefix() {
        assert_eq!(template_path("/unknown/group/resource", None), "/{prefix}");
        assert_eq!(
            template_path("/invalid/path/v1/namespaces/ns/r1/nm?p0=v0", None),
            "/{prefix}"
        );
    }

    #[test]
    fn base_path_is_stripped_and_restored() {
        assert_eq!(
            template_path("/base/path/api/v1/pods/mypod", Some("/base/path")),
            "/base/path/api/v1/pods/{name}"
        );
        assert_eq!(
            template_path(
                "/some/base/url/path/api/v1/namespaces/ns/r1/nm?p0=v0",
                Some("/some/base/url/path")
            ),
            "/some/base/url/path/api/v1/namespaces/{namespace}/r1/{name}"
        );
    }

    #[test]
    fn short_paths_return_unchanged() {
        assert_eq!(
            template_path("/some/base/url/path/api/v1/r1", Some("/some/base/url/path")),
            "/some/base/url/path/api/v1/r1"
        );
        assert_eq!(
            template_path("/some/base/path", Some("/some/base/path")),
            "/some/base/path"
        );
    }

    #[test]
    fn custom_prefix_under_base_collapses() {
        assert_eq!(
            template_path(
                "/some/base/url/path/pre1/v1/namespaces/ns/r1/nm?p0=v0",
                Some("/some/base/url/path")
            ),
            "/{prefix}"
        );
    }
}
