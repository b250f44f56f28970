use pipesign_core::hash;
use pipesign_core::time::{format_rfc3339, DateTime};
use pipesign_core::{Error, Result};

/// A shared access policy: what a SAS grants, to whom, and for how long.
///
/// Immutable value type; the permission string keeps the caller's order
/// because the service re-derives the signed text verbatim.
#[derive(Debug, Clone, Default)]
pub struct SharedAccessPolicy {
    permissions: String,
    start: Option<DateTime>,
    expiry: Option<DateTime>,
    ip_range: Option<String>,
    protocols: Option<String>,
}

impl SharedAccessPolicy {
    /// Create a policy granting the given ordered permission string.
    pub fn new(permissions: impl Into<String>) -> Self {
        Self {
            permissions: permissions.into(),
            ..Default::default()
        }
    }

    /// Set the start of the validity window.
    pub fn with_start(mut self, start: DateTime) -> Self {
        self.start = Some(start);
        self
    }

    /// Set the end of the validity window.
    pub fn with_expiry(mut self, expiry: DateTime) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Restrict the grant to an IP or IP range.
    pub fn with_ip_range(mut self, ip_range: impl Into<String>) -> Self {
        self.ip_range = Some(ip_range.into());
        self
    }

    /// Restrict the grant to the given protocols, e.g. `https`.
    pub fn with_protocols(mut self, protocols: impl Into<String>) -> Self {
        self.protocols = Some(protocols.into());
        self
    }
}

/// Service-level shared access signature over one canonical resource.
///
/// Builds the canonical string-to-sign, computes its HMAC-SHA256 signature
/// and assembles the SAS query parameters. The field order of the signed
/// text is load-bearing: the service reconstructs the identical text to
/// verify the signature, so every change here is a wire-format change.
pub struct ServiceSharedAccessSignature {
    key: String,
    canonical_resource: String,
    policy: Option<SharedAccessPolicy>,
    identifier: Option<String>,
    version: String,
    cache_control: Option<String>,
    content_disposition: Option<String>,
    content_encoding: Option<String>,
    content_language: Option<String>,
    content_type: Option<String>,
}

impl ServiceSharedAccessSignature {
    /// Create a signer for the given canonical resource and account key.
    pub fn new(key: impl Into<String>, canonical_resource: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            canonical_resource: canonical_resource.into(),
            policy: None,
            identifier: None,
            version: crate::constants::AZURE_VERSION.to_string(),
            cache_control: None,
            content_disposition: None,
            content_encoding: None,
            content_language: None,
            content_type: None,
        }
    }

    /// Attach an ad-hoc access policy.
    ///
    /// A signature without a policy is legal when an identifier references a
    /// stored access policy on the service side.
    pub fn with_policy(mut self, policy: SharedAccessPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Reference a stored access policy by identifier.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Override the target API version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Override the Cache-Control the service returns for this SAS.
    pub fn with_cache_control(mut self, v: impl Into<String>) -> Self {
        self.cache_control = Some(v.into());
        self
    }

    /// Override the Content-Disposition the service returns for this SAS.
    pub fn with_content_disposition(mut self, v: impl Into<String>) -> Self {
        self.content_disposition = Some(v.into());
        self
    }

    /// Override the Content-Encoding the service returns for this SAS.
    pub fn with_content_encoding(mut self, v: impl Into<String>) -> Self {
        self.content_encoding = Some(v.into());
        self
    }

    /// Override the Content-Language the service returns for this SAS.
    pub fn with_content_language(mut self, v: impl Into<String>) -> Self {
        self.content_language = Some(v.into());
        self
    }

    /// Override the Content-Type the service returns for this SAS.
    pub fn with_content_type(mut self, v: impl Into<String>) -> Self {
        self.content_type = Some(v.into());
        self
    }

    fn header_overrides(&self) -> [&Option<String>; 5] {
        [
            &self.cache_control,
            &self.content_disposition,
            &self.content_encoding,
            &self.content_language,
            &self.content_type,
        ]
    }

    /// Build the canonical string-to-sign.
    ///
    /// Fields in fixed order, newline separated, absent fields contributing
    /// an empty string. The response-header override block is appended only
    /// when at least one override is set.
    pub fn string_to_sign(&self) -> Result<String> {
        if self.canonical_resource.is_empty() {
            return Err(Error::invalid_argument(
                "canonical resource is required to build a SAS",
            ));
        }

        let policy = self.policy.clone().unwrap_or_default();
        let mut fields = vec![
            policy.permissions.clone(),
            policy.start.map_or(String::new(), format_rfc3339),
            policy.expiry.map_or(String::new(), format_rfc3339),
            self.canonical_resource.clone(),
            self.identifier.clone().unwrap_or_default(),
            policy.ip_range.clone().unwrap_or_default(),
            policy.protocols.clone().unwrap_or_default(),
            self.version.clone(),
        ];

        if self.header_overrides().iter().any(|v| v.is_some()) {
            for v in self.header_overrides() {
                fields.push(v.clone().unwrap_or_default());
            }
        }

        Ok(fields.join("\n"))
    }

    /// Compute the base64 HMAC-SHA256 signature of the string-to-sign.
    pub fn signature(&self) -> Result<String> {
        let string_to_sign = self.string_to_sign()?;
        let decoded_key = hash::base64_decode(&self.key)
            .map_err(|e| Error::authentication("account key is not valid base64").with_source(e))?;

        Ok(hash::base64_hmac_sha256(
            &decoded_key,
            string_to_sign.as_bytes(),
        ))
    }

    /// Assemble the ordered SAS query parameters.
    ///
    /// A parameter is present only when the underlying field is set; absent
    /// fields are omitted entirely rather than emitted empty, matching
    /// exactly what [`Self::string_to_sign`] treated as absent.
    pub fn token(&self) -> Result<Vec<(String, String)>> {
        let mut elements: Vec<(String, String)> =
            vec![("sv".to_string(), self.version.to_string())];

        if let Some(policy) = &self.policy {
            if !policy.permissions.is_empty() {
                elements.push(("sp".to_string(), policy.permissions.clone()));
            }
            if let Some(start) = &policy.start {
                elements.push(("st".to_string(), urlencoded(format_rfc3339(*start))));
            }
            if let Some(expiry) = &policy.expiry {
                elements.push(("se".to_string(), urlencoded(format_rfc3339(*expiry))));
            }
            if let Some(ip) = &policy.ip_range {
                elements.push(("sip".to_string(), ip.to_string()));
            }
            if let Some(protocols) = &policy.protocols {
                elements.push(("spr".to_string(), protocols.to_string()));
            }
        }
        if let Some(identifier) = &self.identifier {
            elements.push(("si".to_string(), identifier.to_string()));
        }

        let overrides = ["rscc", "rscd", "rsce", "rscl", "rsct"];
        for (name, value) in overrides.iter().zip(self.header_overrides()) {
            if let Some(v) = value {
                elements.push((name.to_string(), urlencoded(v.clone())));
            }
        }

        elements.push(("sig".to_string(), urlencoded(self.signature()?)));

        Ok(elements)
    }
}

fn urlencoded(s: String) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
