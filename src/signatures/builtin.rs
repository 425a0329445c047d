//! The embedded signature catalog.
//!
//! Rules are grouped by phase. Weights are per-rule multipliers in [0, 20];
//! the final score contribution of a finding is `weight * phase multiplier`.
//! Patterns compile case-insensitive and multi-line; the few rules whose
//! semantics depend on letter case opt back out inline with `(?-i)`.

use super::categories::*;
use super::{RawSignature, SignatureSet};

fn sig(
    id: &str,
    phase: &str,
    severity: &str,
    weight: f64,
    pattern: &str,
    description: &str,
) -> RawSignature {
    RawSignature {
        id: id.to_string(),
        phase: phase.to_string(),
        severity: severity.to_string(),
        weight,
        pattern: pattern.to_string(),
        description: description.to_string(),
        language_hints: None,
        category: None,
        false_positive_likelihood: None,
    }
}

impl RawSignature {
    fn langs(mut self, hints: &[&str]) -> Self {
        self.language_hints = Some(hints.iter().map(|h| h.to_string()).collect());
        self
    }

    fn cat(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    fn fp(mut self, likelihood: &str) -> Self {
        self.false_positive_likelihood = Some(likelihood.to_string());
        self
    }
}

/// Build the full builtin catalog. Compiled through the same validation
/// path as external sets; a broken entry here fails every command early.
pub fn catalog() -> SignatureSet {
    let mut signatures = Vec::new();
    signatures.extend(install_hooks());
    signatures.extend(code_patterns());
    signatures.extend(network_exfil());
    signatures.extend(credentials());
    signatures.extend(obfuscation());
    signatures.extend(provenance());
    SignatureSet { signatures }
}

// ---------------------------------------------------------------------------
// Phase 1: Install Hooks (10x) -- only evaluated against recognized manifests
// ---------------------------------------------------------------------------

fn install_hooks() -> Vec<RawSignature> {
    vec![
        sig(
            "INSTALL-001",
            "install_hooks",
            "critical",
            10.0,
            r"cmdclass\s*=|\[tool\.setuptools\.cmdclass\]",
            "custom install command class (code runs at install time)",
        )
        .cat(PYTHON_MANIFEST),
        sig(
            "INSTALL-002",
            "install_hooks",
            "critical",
            10.0,
            r"(pre_install|post_install|install_scripts)",
            "custom setup install hook",
        )
        .cat(PYTHON_MANIFEST),
        sig(
            "INSTALL-003",
            "install_hooks",
            "critical",
            10.0,
            r#""(preinstall|postinstall|preuninstall|postuninstall)"\s*:"#,
            "npm lifecycle script (runs automatically on install)",
        )
        .cat(NODE_MANIFEST),
        sig(
            "INSTALL-004",
            "install_hooks",
            "high",
            6.0,
            r#""(prepare|prepublish|prepublishOnly)"\s*:"#,
            "npm publish lifecycle script",
        )
        .cat(NODE_MANIFEST),
        sig(
            "INSTALL-005",
            "install_hooks",
            "high",
            6.0,
            r"^install\s*:[^\n]*\b(curl|wget|bash|sh)\b",
            "Makefile install target that fetches or executes",
        )
        .cat(MAKE_MANIFEST),
        sig(
            "INSTALL-006",
            "install_hooks",
            "low",
            2.0,
            r"^install\s*:",
            "Makefile install target",
        )
        .cat(MAKE_MANIFEST)
        .fp("high"),
        sig(
            "INSTALL-007",
            "install_hooks",
            "low",
            2.0,
            r"build-backend\s*=",
            "custom build backend declared",
        )
        .cat(PYTHON_MANIFEST)
        .fp("high"),
        sig(
            "INSTALL-008",
            "install_hooks",
            "high",
            6.0,
            r"(curl|wget)[^\n]*\|\s*(ba|z)?sh\b",
            "pipe-to-shell inside a manifest",
        ),
        sig(
            "INSTALL-009",
            "install_hooks",
            "medium",
            4.0,
            r#""command"\s*:\s*""#,
            "MCP server command declaration",
        )
        .cat(MCP_MANIFEST),
        sig(
            "INSTALL-010",
            "install_hooks",
            "high",
            6.0,
            r"run\s*:[^\n]*(curl|wget)[^\n]*https?://",
            "CI step downloading remote content",
        )
        .cat(CI_MANIFEST),
        sig(
            "INSTALL-011",
            "install_hooks",
            "medium",
            4.0,
            r"mcpServers|mcp_servers",
            "MCP server registry entry",
        )
        .cat(MCP_MANIFEST),
        sig(
            "INSTALL-012",
            "install_hooks",
            "low",
            2.0,
            r"claude_desktop_config|mcp_config\.json|\.mcp\.json",
            "reference to an MCP configuration file",
        ),
    ]
}

// ---------------------------------------------------------------------------
// Phase 2: Code Patterns (5x)
// ---------------------------------------------------------------------------

fn code_patterns() -> Vec<RawSignature> {
    vec![
        sig(
            "CODE-001",
            "code_patterns",
            "high",
            2.0,
            r"\beval\s*\(",
            "eval() call - arbitrary code execution",
        ),
        sig(
            "CODE-002",
            "code_patterns",
            "high",
            2.0,
            r"\bexec\s*\(",
            "exec() call - arbitrary code execution",
        )
        .langs(&["python"]),
        sig(
            "CODE-003",
            "code_patterns",
            "medium",
            1.0,
            r"\bcompile\s*\(",
            "compile() call - dynamic code compilation",
        )
        .langs(&["python"])
        .fp("high"),
        sig(
            "CODE-004",
            "code_patterns",
            "critical",
            3.0,
            r"pickle\.(loads?|Unpickler)",
            "pickle deserialization - arbitrary code execution",
        )
        .langs(&["python"]),
        sig(
            "CODE-005",
            "code_patterns",
            "high",
            2.0,
            r"marshal\.loads?\s*\(",
            "marshal deserialization - code execution risk",
        )
        .langs(&["python"]),
        sig(
            "CODE-006",
            "code_patterns",
            "high",
            2.0,
            r"yaml\.(unsafe_)?load\s*\(",
            "YAML unsafe load - potential code execution",
        )
        .langs(&["python"])
        .fp("medium"),
        sig(
            "CODE-007",
            "code_patterns",
            "high",
            2.0,
            r"\bchild_process\b|\bexecSync\s*\(",
            "child process spawning - command execution",
        )
        .langs(&["javascript", "typescript"]),
        sig(
            "CODE-008",
            "code_patterns",
            "high",
            2.0,
            r"(?-i)new\s+Function\s*\(",
            "Function constructor - dynamic code execution",
        )
        .langs(&["javascript", "typescript"]),
        sig(
            "CODE-009",
            "code_patterns",
            "high",
            2.0,
            r"__import__\s*\(",
            "__import__() - dynamic import",
        )
        .langs(&["python"]),
        sig(
            "CODE-010",
            "code_patterns",
            "medium",
            1.0,
            r"importlib\.import_module\s*\(",
            "importlib.import_module - dynamic import",
        )
        .langs(&["python"]),
        sig(
            "CODE-011",
            "code_patterns",
            "medium",
            1.0,
            r#"require\s*\(\s*[^'")\s]"#,
            "dynamic require() - variable module loading",
        )
        .langs(&["javascript"]),
        sig(
            "CODE-012",
            "code_patterns",
            "medium",
            1.0,
            r"subprocess\.(call|run|Popen|check_output|check_call)\s*\(",
            "subprocess invocation - command execution",
        )
        .langs(&["python"]),
        sig(
            "CODE-013",
            "code_patterns",
            "high",
            2.0,
            r"os\.(system|popen|exec[lv][pe]{0,2}|spawn[lv][pe]{0,2})\s*\(",
            "os command execution",
        )
        .langs(&["python"]),
        sig(
            "CODE-014",
            "code_patterns",
            "high",
            2.0,
            r"shell\s*=\s*True",
            "shell=True - shell injection risk",
        )
        .langs(&["python"]),
        sig(
            "CODE-015",
            "code_patterns",
            "high",
            2.0,
            r"vm\.runIn(New|This)Context\s*\(",
            "Node vm sandbox execution",
        )
        .langs(&["javascript", "typescript"]),
        sig(
            "CODE-016",
            "code_patterns",
            "high",
            2.0,
            r"allow_dangerous|skip_confirmation|bypass_approval|auto_approve\s*[:=]\s*true",
            "permission bypass flag",
        ),
        sig(
            "CODE-017",
            "code_patterns",
            "medium",
            1.0,
            r"mcp[_-]?server|MCPServer|create_mcp_server",
            "MCP server creation",
        ),
        sig(
            "CODE-018",
            "code_patterns",
            "medium",
            1.0,
            r"tool_call|execute_tool|run_tool",
            "MCP tool execution surface",
        )
        .fp("medium"),
    ]
}

// ---------------------------------------------------------------------------
// Phase 3: Network / Exfiltration (3x)
// ---------------------------------------------------------------------------

fn network_exfil() -> Vec<RawSignature> {
    vec![
        sig(
            "NET-001",
            "network_exfil",
            "medium",
            1.0,
            r"requests\.(get|post|put|delete|patch|head)\s*\(",
            "HTTP request via requests library",
        )
        .langs(&["python"]),
        sig(
            "NET-002",
            "network_exfil",
            "medium",
            1.0,
            r"urllib\.request\.urlopen|\burlopen\s*\(",
            "HTTP request via urllib",
        )
        .langs(&["python"]),
        sig(
            "NET-003",
            "network_exfil",
            "medium",
            1.0,
            r#"fetch\s*\(\s*[`'"]https?://"#,
            "fetch() to external URL",
        )
        .langs(&["javascript", "typescript"]),
        sig(
            "NET-004",
            "network_exfil",
            "medium",
            1.0,
            r"axios\.(get|post|put|delete|patch)\s*\(",
            "HTTP request via axios",
        )
        .langs(&["javascript", "typescript"]),
        sig(
            "NET-005",
            "network_exfil",
            "high",
            2.0,
            r"(webhook|beacon|exfil|callback)[^\n]{0,80}https?://",
            "webhook / callback URL",
        ),
        sig(
            "NET-006",
            "network_exfil",
            "critical",
            3.0,
            r"https?://[^\s'\x22]*(webhook\.site|requestbin|pipedream\.net|hookbin|ngrok\.io|ngrok-free|serveo\.net|localhost\.run|burpcollaborator)",
            "known exfiltration / tunneling service URL",
        ),
        sig(
            "NET-007",
            "network_exfil",
            "high",
            2.0,
            r"socket\.socket\s*\(",
            "raw socket creation",
        )
        .langs(&["python"]),
        sig(
            "NET-008",
            "network_exfil",
            "high",
            2.0,
            r"net\.createConnection\s*\(|new\s+net\.Socket",
            "raw socket creation",
        )
        .langs(&["javascript", "typescript"]),
        sig(
            "NET-009",
            "network_exfil",
            "medium",
            1.0,
            r"dns\.(resolver|query|promises)|\bresolve4\s*\(",
            "DNS resolution - possible DNS tunneling",
        ),
        sig(
            "NET-010",
            "network_exfil",
            "medium",
            1.0,
            r"(curl|wget)\s+[^\n]*https?://",
            "curl/wget to external URL",
        )
        .langs(&["shell"]),
        sig(
            "NET-011",
            "network_exfil",
            "critical",
            3.0,
            r"bash\s+-i\s+>&|\bnc(\.exe)?\s+-e\b|/dev/tcp/",
            "reverse shell construction",
        ),
        sig(
            "NET-012",
            "network_exfil",
            "low",
            1.0,
            r"stdio_transport|sse_transport|StreamableHTTPTransport",
            "MCP transport configuration",
        ),
        sig(
            "NET-013",
            "network_exfil",
            "high",
            2.0,
            r"mcp[^\n]{0,40}proxy|proxy[^\n]{0,40}mcp",
            "MCP proxy configuration - interception risk",
        ),
    ]
}

// ---------------------------------------------------------------------------
// Phase 4: Credentials (2x)
// ---------------------------------------------------------------------------

fn credentials() -> Vec<RawSignature> {
    vec![
        sig(
            "CRED-001",
            "credentials",
            "medium",
            2.0,
            r#"os\.(environ(\.get)?\s*[\[\(]|getenv\s*\()\s*['"]?(AWS_|SECRET|API_?KEY|TOKEN|PASSWORD|PRIVATE|CREDENTIAL)"#,
            "environment read of sensitive key",
        )
        .langs(&["python"]),
        sig(
            "CRED-002",
            "credentials",
            "medium",
            2.0,
            r"process\.env\.(AWS_|SECRET|API_?KEY|TOKEN|PASSWORD|PRIVATE|CREDENTIAL)",
            "environment read of sensitive key",
        )
        .langs(&["javascript", "typescript"]),
        sig(
            "CRED-003",
            "credentials",
            "high",
            3.0,
            r"JSON\.stringify\s*\(\s*process\.env|dict\s*\(\s*os\.environ\s*\)|str\s*\(\s*os\.environ",
            "serialization of the full process environment",
        ),
        sig(
            "CRED-004",
            "credentials",
            "critical",
            5.0,
            r"\.aws/(credentials|config)",
            "AWS credentials file access",
        ),
        sig(
            "CRED-005",
            "credentials",
            "critical",
            5.0,
            r"(?-i)\bAKIA[0-9A-Z]{16}\b",
            "hardcoded AWS access key id",
        ),
        sig(
            "CRED-006",
            "credentials",
            "critical",
            5.0,
            r"\.ssh/(id_rsa|id_ed25519|id_ecdsa|authorized_keys|known_hosts)",
            "SSH key file access",
        ),
        sig(
            "CRED-007",
            "credentials",
            "critical",
            5.0,
            r"-----BEGIN[ A-Z]*PRIVATE KEY-----",
            "embedded private key",
        ),
        sig(
            "CRED-008",
            "credentials",
            "high",
            3.0,
            r#"(api[_-]?key|api[_-]?secret|access[_-]?token)\s*[:=]\s*['"][A-Za-z0-9_\-]{16,}"#,
            "hardcoded API key or secret",
        )
        .fp("medium"),
        sig(
            "CRED-009",
            "credentials",
            "high",
            3.0,
            r#"\b(password|passwd|pwd)\b\s*[:=]\s*['"][^'"\n]{8,}"#,
            "hardcoded password",
        )
        .fp("high"),
        sig(
            "CRED-010",
            "credentials",
            "critical",
            5.0,
            r#""type"\s*:\s*"service_account""#,
            "GCP service account key material",
        ),
        sig(
            "CRED-011",
            "credentials",
            "critical",
            5.0,
            r"(?-i)\bgh[pousr]_[A-Za-z0-9]{36,}",
            "GitHub personal access token",
        ),
        sig(
            "CRED-012",
            "credentials",
            "high",
            3.0,
            r"\.netrc\b|\.npmrc\b|\.pypirc\b|\.docker/config\.json|\.kube/config",
            "credential store file access",
        ),
        sig(
            "CRED-013",
            "credentials",
            "medium",
            2.0,
            r"MCP_API_KEY|MCP_SECRET|MCP_TOKEN|mcp_auth",
            "MCP credential reference",
        ),
    ]
}

// ---------------------------------------------------------------------------
// Phase 5: Obfuscation (5x) -- encoded-run rules require >= 40 chars
// ---------------------------------------------------------------------------

fn obfuscation() -> Vec<RawSignature> {
    vec![
        sig(
            "OBF-001",
            "obfuscation",
            "high",
            2.0,
            r"base64\.(urlsafe_|standard_)?b64decode\s*\(|base64\.decodebytes\s*\(",
            "base64 decoding (potential obfuscated payload)",
        )
        .langs(&["python"]),
        sig(
            "OBF-002",
            "obfuscation",
            "high",
            2.0,
            r"\batob\s*\(",
            "atob() base64 decoding",
        )
        .langs(&["javascript", "typescript"]),
        sig(
            "OBF-003",
            "obfuscation",
            "high",
            2.0,
            r#"Buffer\.from\s*\([^)\n]*,\s*['"]base64['"]"#,
            "Buffer.from base64 decoding",
        )
        .langs(&["javascript", "typescript"]),
        sig(
            "OBF-004",
            "obfuscation",
            "medium",
            1.0,
            r#"['"][A-Za-z0-9+/]{40,}={0,2}['"]"#,
            "long base64-looking constant",
        )
        .fp("medium"),
        sig(
            "OBF-005",
            "obfuscation",
            "high",
            2.0,
            r"(\\x[0-9a-f]{2}){20,}",
            "long hex escape run",
        ),
        sig(
            "OBF-006",
            "obfuscation",
            "high",
            2.0,
            r"(0x[0-9a-f]{1,2}\s*,\s*){20,}",
            "hex byte array (likely packed payload)",
        ),
        sig(
            "OBF-007",
            "obfuscation",
            "high",
            2.0,
            r"String\.fromCharCode\s*\(",
            "character code string construction",
        )
        .langs(&["javascript", "typescript"]),
        sig(
            "OBF-008",
            "obfuscation",
            "medium",
            1.0,
            r"(chr\s*\(\s*\d+\s*\)\s*\+\s*){3,}",
            "character code string construction",
        )
        .langs(&["python"]),
        sig(
            "OBF-009",
            "obfuscation",
            "medium",
            1.0,
            r"(\\u[0-9a-f]{4}){10,}",
            "long unicode escape run",
        ),
        sig(
            "OBF-010",
            "obfuscation",
            "medium",
            1.0,
            r"codecs\.decode\s*\(",
            "codecs decode - potential obfuscation",
        )
        .langs(&["python"]),
        sig(
            "OBF-011",
            "obfuscation",
            "medium",
            1.0,
            r"(zlib|gzip|bz2|lzma)\.(decompress|inflate(Sync)?)\s*\(",
            "inline decompression of embedded data",
        ),
        sig(
            "OBF-012",
            "obfuscation",
            "critical",
            4.0,
            r"exec\s*\(\s*base64|eval\s*\(\s*(atob|Buffer\.from|base64)",
            "decode-and-execute of hidden payload",
        ),
        sig(
            "OBF-013",
            "obfuscation",
            "high",
            2.0,
            r"tool_description[^\n]{0,80}base64|encoded_tool|obfuscated_prompt",
            "obfuscated MCP tool definition",
        ),
    ]
}

// ---------------------------------------------------------------------------
// Phase 6: Provenance (1x, per-rule weights 1-3) -- filesystem facts only
// ---------------------------------------------------------------------------

fn provenance() -> Vec<RawSignature> {
    vec![
        sig(
            "PROV-001",
            "provenance",
            "low",
            1.0,
            r"(^|/)\.[^/]+$",
            "hidden file in tree",
        )
        .cat(PATH)
        .fp("high"),
        sig(
            "PROV-002",
            "provenance",
            "medium",
            2.0,
            r"\.(exe|dll|so|dylib|bin|o|a|pyc|pyo|class|jar|war|wasm|node)$",
            "binary artifact in source tree",
        )
        .cat(PATH),
        sig(
            "PROV-003",
            "provenance",
            "high",
            3.0,
            r"backdoor|exploit|payload|reverse_shell|revshell|keylogger|stealer|trojan|rootkit|c2[_-]",
            "suspicious filename",
        )
        .cat(PATH),
        sig(
            "PROV-004",
            "provenance",
            "low",
            1.0,
            r"^oversized-file$",
            "file exceeding the per-file cap was skipped",
        )
        .cat(FACT),
        sig(
            "PROV-005",
            "provenance",
            "low",
            1.0,
            r"^shallow-clone$",
            "shallow clone - limited history available",
        )
        .cat(FACT),
        sig(
            "PROV-006",
            "provenance",
            "medium",
            2.0,
            r"^no-vcs-history$",
            "package-shaped tree without version history",
        )
        .cat(FACT),
    ]
}
