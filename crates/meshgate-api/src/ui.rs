//! Embedded management UI: one HTML page and its script.

use axum::http::header;
use axum::response::{Html, IntoResponse};

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>meshgate supernode</title>
<style>
 body { font-family: monospace; margin: 2em; }
 h1 { font-size: 1.2em; }
 table { border-collapse: collapse; margin-bottom: 1.5em; }
 td, th { border: 1px solid #999; padding: 0.2em 0.6em; text-align: left; }
 #error { color: #b00; }
</style>
<script src="script.js"></script>
</head>
<body onload="startPage()">
<h1>meshgate supernode</h1>
<div id="error"></div>
<div id="info"></div>
<h2>Communities</h2>
<table id="communities"></table>
<h2>Edges</h2>
<table id="edges"></table>
<h2>Supernodes</h2>
<table id="supernodes"></table>
</body>
</html>
"#;

const SCRIPT_JS: &str = r#"'use strict';

let rpcId = 0;

async function rpc(method, params) {
    const body = { jsonrpc: '2.0', id: String(++rpcId), method: method };
    if (params !== undefined) { body.params = params; }
    const response = await fetch('/v1', {
        method: 'POST',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify(body),
    });
    const reply = await response.json();
    if (reply.error) { throw new Error(reply.error.message); }
    return reply.result;
}

function renderTable(el, rows) {
    el.innerHTML = '';
    if (!rows.length) { return; }
    const keys = Object.keys(rows[0]);
    const head = el.insertRow();
    for (const key of keys) {
        const th = document.createElement('th');
        th.textContent = key;
        head.appendChild(th);
    }
    for (const row of rows) {
        const tr = el.insertRow();
        for (const key of keys) {
            tr.insertCell().textContent = String(row[key]);
        }
    }
}

async function refresh() {
    try {
        const info = await rpc('get_info');
        document.getElementById('info').textContent =
            info.version + ' — ' + info.macaddr + ' — ' + info.sockaddr;
        renderTable(document.getElementById('communities'), await rpc('get_communities'));
        renderTable(document.getElementById('edges'), await rpc('get_edges'));
        renderTable(document.getElementById('supernodes'), await rpc('get_supernodes'));
        document.getElementById('error').textContent = '';
    } catch (e) {
        document.getElementById('error').textContent = String(e);
    }
}

function startPage() {
    refresh();
    setInterval(refresh, 5000);
}
"#;

pub async fn index() -> impl IntoResponse {
    Html(INDEX_HTML)
}

pub async fn script() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/javascript")], SCRIPT_JS)
}
