pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# CONVEYOR CONFIGURATION
# =============================================================================
# Conveyor pulls security events from vendor APIs and forwards them in batches
# to an intake endpoint. Each stream is one logical event source with its own
# checkpoint.
#
# Values of the form $env{NAME} are replaced by environment variables when the
# file is loaded, which keeps secrets out of the file.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/conveyor/config.yml
#   3. /etc/conveyor/config.yml
#
# Environment overrides: QUEUE_SIZE, BATCH_SIZE, NB_FORWARDERS, NB_CONSUMERS,
# LOG_LEVEL (debug, info, warning, error).

# Checkpoints and dedup state are written to <data_dir>/context.json
data_dir: ~/.local/share/conveyor

# =============================================================================
# INTAKE
# =============================================================================

intake:
  server: https://intake.example.com
  key: replace-with-intake-key
  # POST target, relative to server
  path: /batch
  # Events per batch; BATCH_SIZE overrides
  chunk_size: 10000
  # A partial batch is pushed once its oldest event is this old
  max_flush_age: 5s
  timeout: 60s
  max_retries: 5

# =============================================================================
# RUNTIME
# =============================================================================

runtime:
  queue_size: 10000
  nb_forwarders: 1
  nb_consumers: 1
  # Dead workers are detected at this interval and restarted after the cool-down
  supervise_interval: 5s
  restart_cooldown: 5s
  consumer_join_timeout: 2s
  forwarder_join_timeout: 5s

# =============================================================================
# CONNECTIONS
# =============================================================================
# One HTTP profile per vendor. Streams sharing a connection share its rate
# limit and its token.
#
# auth.mode is one of:
#   client_credentials  token_url, client_id, client_secret, scope
#   refresh_token       token_url, client_id, client_secret, refresh_token
#   api_key             key, header (default Authorization), scheme

connections:
  identity_provider:
    auth:
      mode: api_key
      key: replace-with-api-key
      scheme: SSWS
    rate_limit:
      requests: 10
      per: 1s
    timeout: 30s
    max_retries: 5
    backoff_base: 1s

# =============================================================================
# AGGREGATIONS (optional)
# =============================================================================
# Fold repeating events into one representative carrying a repeat count.
# condition: JSON pointer -> value the event must hold
# fingerprint: JSON pointers identifying "the same" event

aggregations:
  authentication:
    - name: failed_logins
      ttl: 1m
      condition:
        /outcome/result: FAILURE
      fingerprint:
        - /actor/id
        - /client/ipAddress

# =============================================================================
# STREAMS
# =============================================================================
# source.driver is http_json (polled) or ndjson_stream (pushed).
# http_json pagination.mode is single, cursor, since or window.

streams:
  system_log:
    connection: identity_provider
    frequency: 60s
    lag: 30s
    aggregation: authentication
    dedup:
      capacity: 10000
      ttl: 1h
      persist: true
    source:
      driver: http_json
      url: https://idp.example.com/api/v1/logs
      query:
        limit: "1000"
      timestamp: /published
      id: /uuid
      pagination:
        mode: since
        param: since
        lookback: 1h
"#
    .to_string()
}
