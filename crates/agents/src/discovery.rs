//! Keyword and capability scoring over a static table of package bundles.

use serde::Serialize;

const MAX_DISCOVERED: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub python_packages: &'static [&'static str],
    pub javascript_packages: &'static [&'static str],
    /// Lowercase phrases matched against the query.
    pub capabilities: &'static [&'static str],
    pub category: &'static str,
}

impl ToolEntry {
    /// Packages for `language`; unknown languages have none.
    #[must_use]
    pub fn packages(&self, language: &str) -> &'static [&'static str] {
        match language {
            "python" => self.python_packages,
            "javascript" => self.javascript_packages,
            _ => &[],
        }
    }

    fn score(&self, query_lower: &str, suggested: &[String], language: &str) -> u32 {
        let capability_hits = self
            .capabilities
            .iter()
            .filter(|cap| query_lower.contains(*cap))
            .count();
        let packages = self.packages(language);
        let package_hits = suggested
            .iter()
            .filter(|pkg| packages.contains(&pkg.as_str()))
            .count();
        let name_hit = query_lower.contains(&self.name.to_lowercase());

        2 * capability_hits as u32 + 3 * package_hits as u32 + if name_hit { 2 } else { 0 }
    }
}

const fn python(
    id: &'static str,
    name: &'static str,
    description: &'static str,
    packages: &'static [&'static str],
    capabilities: &'static [&'static str],
    category: &'static str,
) -> ToolEntry {
    ToolEntry {
        id,
        name,
        description,
        python_packages: packages,
        javascript_packages: &[],
        capabilities,
        category,
    }
}

pub static TOOL_REGISTRY: &[ToolEntry] = &[
    python(
        "data-analysis",
        "Data Analysis Suite",
        "Pandas and NumPy for data manipulation and analysis",
        &["pandas", "numpy"],
        &["csv", "data", "dataframe", "analysis", "statistics", "table", "spreadsheet", "excel"],
        "data",
    ),
    python(
        "data-visualization",
        "Data Visualization",
        "Matplotlib and Plotly charts",
        &["matplotlib", "plotly"],
        &["chart", "graph", "plot", "visualization", "histogram", "scatter", "bar chart", "pie chart"],
        "data",
    ),
    python(
        "web-scraping",
        "Web Scraping",
        "Fetch and parse web pages",
        &["requests", "beautifulsoup4", "lxml"],
        &["scrape", "fetch", "website", "url", "html", "web page", "download page", "crawl"],
        "web",
    ),
    python(
        "finance",
        "Financial Data",
        "Stock prices and market data via yfinance",
        &["yfinance", "pandas"],
        &["stock", "price", "finance", "market", "ticker", "shares", "portfolio", "investment"],
        "finance",
    ),
    python(
        "api-client",
        "API Client",
        "HTTP API calls",
        &["requests"],
        &["api", "rest", "http", "endpoint", "json", "fetch data", "call api"],
        "web",
    ),
    python(
        "image-processing",
        "Image Processing",
        "Image manipulation with Pillow",
        &["Pillow"],
        &["image", "resize", "crop", "filter", "thumbnail", "convert image", "png", "jpg"],
        "media",
    ),
    python(
        "pdf",
        "PDF Processing",
        "Read and manipulate PDFs",
        &["PyPDF2", "pdfplumber"],
        &["pdf", "extract text", "read pdf", "pdf pages"],
        "document",
    ),
    python(
        "ml-basic",
        "Machine Learning",
        "Classic ML with scikit-learn",
        &["scikit-learn", "pandas", "numpy"],
        &["machine learning", "predict", "classify", "regression", "cluster", "train model", "ml"],
        "ml",
    ),
    python(
        "file-conversion",
        "File Conversion",
        "Convert between document and table formats",
        &["pandas", "openpyxl", "python-pptx"],
        &["convert", "xlsx", "csv to json", "json to csv", "excel", "transform"],
        "document",
    ),
    python(
        "nlp",
        "Text Processing",
        "Natural language processing with NLTK",
        &["nltk"],
        &["sentiment", "tokenize", "nlp", "text analysis", "word frequency", "language"],
        "ml",
    ),
    python(
        "web-automation",
        "Web Automation",
        "Browser automation with Selenium",
        &["selenium", "webdriver-manager"],
        &["automate browser", "selenium", "click", "fill form", "screenshot website"],
        "web",
    ),
    python(
        "crypto-data",
        "Cryptocurrency Data",
        "Crypto prices and market data",
        &["requests", "pandas"],
        &["crypto", "bitcoin", "ethereum", "cryptocurrency", "coin price"],
        "finance",
    ),
    python(
        "datetime",
        "Date & Time Utilities",
        "Date and timezone handling",
        &["arrow", "pytz"],
        &["timezone", "date", "time", "convert timezone", "schedule", "calendar"],
        "utility",
    ),
    python(
        "email",
        "Email Utilities",
        "Parse and build emails",
        &["beautifulsoup4"],
        &["email", "parse email", "html email"],
        "utility",
    ),
    python(
        "qrcode",
        "QR Code Generator",
        "Generate QR codes",
        &["qrcode", "Pillow"],
        &["qr code", "qr", "barcode", "generate qr"],
        "utility",
    ),
];

/// Up to three entries with a positive score, best first. Ties keep table
/// order.
#[must_use]
pub fn discover_tools(
    query: &str,
    suggested_packages: &[String],
    language: &str,
) -> Vec<&'static ToolEntry> {
    let query_lower = query.to_lowercase();
    let mut scored: Vec<(&'static ToolEntry, u32)> = TOOL_REGISTRY
        .iter()
        .map(|tool| (tool, tool.score(&query_lower, suggested_packages, language)))
        .filter(|(_, score)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    scored
        .into_iter()
        .take(MAX_DISCOVERED)
        .map(|(tool, _)| tool)
        .collect()
}

/// Union of the entries' packages for `language`, first occurrence wins.
#[must_use]
pub fn packages_to_install(tools: &[&ToolEntry], language: &str) -> Vec<String> {
    let mut packages: Vec<String> = Vec::new();
    for pkg in tools.iter().flat_map(|tool| tool.packages(language)) {
        if !packages.iter().any(|p| p == pkg) {
            packages.push((*pkg).to_string());
        }
    }
    packages
}
